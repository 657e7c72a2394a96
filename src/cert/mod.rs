// src/cert/mod.rs
pub mod inspect;
mod openssl;
pub mod operations;
mod types;
pub mod verification;

use thiserror::Error;

pub use operations::{api_server_alt_names, ChainRequest, TrustChainBuilder};
pub use types::{
    cert_file_path, config_file_path, key_file_path, AltNames, CertificateConfig,
    CertificateRecord, CertificateType, KeyPurpose, TrustChain, CA_CERT_NAME, CERT_PATH_PREFIX,
    KUBE_ADMIN_CERT_NAME, KUBE_API_CERT_NAME, KUBE_CONTROLLER_CERT_NAME, KUBE_NODE_CERT_NAME,
    KUBE_PROXY_CERT_NAME, KUBE_SCHEDULER_CERT_NAME,
};

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("openssl error: {0}")]
    OpenSsl(#[from] ::openssl::error::ErrorStack),

    #[error("invalid host address {address:?} for certificate SAN")]
    InvalidAddress { address: String },

    #[error("no control plane hosts to issue certificates for")]
    NoControlPlane,

    #[error("certificate {0} is missing from the trust chain")]
    MissingCertificate(String),

    #[error("certificate {0} does not validate against the cluster authority")]
    Verification(String),

    #[error("failed to encode certificate material: {0}")]
    Encoding(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),
}
