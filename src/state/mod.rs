//! Cluster state: what the operator asked for and what was last deployed.

pub mod file;
pub mod legacy;
mod reconciler;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::cert::TrustChain;
use crate::config::ClusterConfig;
use crate::retry::RetryError;

pub use reconciler::{
    reconcile_certificates, StateReconciler, DEFAULT_FETCH_TIMEOUT, DEFAULT_SAVE_TIMEOUT,
    FULL_STATE_KEY, LEGACY_STATE_KEY,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(rename = "rkeConfig", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ClusterConfig>,
    #[serde(rename = "certificatesBundle", default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<TrustChain>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(rename = "desiredState", default)]
    pub desired: ClusterSnapshot,
    #[serde(rename = "currentState", default)]
    pub current: ClusterSnapshot,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid cluster state: {0}")]
    InvalidInput(String),

    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout { operation: String, timeout: Duration },

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("failed to serialize cluster state: {0}")]
    Serialization(String),

    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RetryError> for StateError {
    fn from(error: RetryError) -> Self {
        match error {
            RetryError::Timeout {
                operation, timeout, ..
            } => StateError::Timeout { operation, timeout },
            RetryError::Cancelled { operation } => StateError::Cancelled(operation),
        }
    }
}
