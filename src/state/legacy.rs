//! Adoption of clusters deployed before state tracking existed.
//!
//! Such clusters have an admin kubeconfig on the operator's machine and the
//! bare cluster config stored under the old config map key, but no tracked
//! state. Their certificates are recovered from the cluster secrets so the
//! next run reuses them instead of issuing a new authority.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use super::{ClusterSnapshot, ClusterState, StateReconciler, LEGACY_STATE_KEY};
use crate::cert::verification::verify_chain;
use crate::cert::{CertificateType, PkiError, TrustChain};
use crate::config::ClusterConfig;
use crate::retry::{retry_until, RetryError};
use crate::store::{record_from_secret, CredentialStore, StoreError};

#[derive(Debug, Error)]
enum LegacyError {
    #[error("legacy cluster config unavailable: {0}")]
    Config(#[from] RetryError),
    #[error("legacy cluster config does not parse: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read certificate {name}: {source}")]
    Secret { name: String, source: StoreError },
    #[error("recovered certificate is invalid: {0}")]
    Certificate(#[from] PkiError),
}

/// Recovers the state of a cluster provisioned by an older release.
///
/// Does nothing when `prior` is known or no admin kubeconfig exists. Every
/// failure is logged and treated as "no legacy cluster".
pub async fn upgrade_legacy_cluster(
    local_admin_config: &Path,
    prior: Option<&ClusterState>,
    store: &dyn CredentialStore,
    reconciler: &StateReconciler,
) -> Option<ClusterState> {
    if prior.is_some() {
        return None;
    }
    if !local_admin_config.exists() {
        return None;
    }

    info!(
        "[state] Found kubeconfig {} without cluster state, checking for a legacy cluster",
        local_admin_config.display()
    );
    match recover(local_admin_config, store, reconciler).await {
        Ok(state) => {
            info!("[state] Recovered legacy cluster state");
            Some(state)
        }
        Err(e) => {
            warn!("[state] Could not recover legacy cluster, treating as new: {}", e);
            None
        }
    }
}

async fn recover(
    local_admin_config: &Path,
    store: &dyn CredentialStore,
    reconciler: &StateReconciler,
) -> Result<ClusterState, LegacyError> {
    let blob = retry_until(
        &reconciler.fetch_policy(),
        "fetch legacy cluster config",
        reconciler.cancellation(),
        move || async move { store.get_config_blob(LEGACY_STATE_KEY).await },
    )
    .await?;
    let config: ClusterConfig = serde_yaml::from_slice(&blob)?;

    let admin_path = local_admin_config.to_string_lossy();
    let mut records = BTreeMap::new();
    for cert_type in CertificateType::ALL {
        let name = cert_type.name();
        let fields = store
            .get_secret(name)
            .await
            .map_err(|source| LegacyError::Secret {
                name: name.to_string(),
                source,
            })?;
        let record = record_from_secret(name, &fields, &admin_path)?;
        records.insert(name.to_string(), record);
    }
    let certificates = TrustChain::from_records(records);
    verify_chain(&certificates)?;

    Ok(ClusterState {
        desired: ClusterSnapshot {
            config: None,
            certificates: Some(certificates.clone()),
        },
        current: ClusterSnapshot {
            config: Some(config),
            certificates: Some(certificates),
        },
    })
}
