use thiserror::Error;

use crate::cert::PkiError;
use crate::config::ConfigError;
use crate::deploy::DeployError;
use crate::state::StateError;

/// Errors surfaced by a full cluster run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("certificate error: {0}")]
    Pki(#[from] PkiError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("[{plane}] {} unit(s) failed to deploy", .failures.len())]
    Deploy {
        plane: String,
        failures: Vec<DeployError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
