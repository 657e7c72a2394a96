//! Durable storage for certificates and cluster state.

mod kubectl;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::cert::{CertificateRecord, CertificateType, PkiError};

pub use kubectl::KubectlStore;
pub use memory::MemoryStore;

pub const CERTIFICATE_FIELD: &str = "Certificate";
pub const KEY_FIELD: &str = "Key";
pub const CONFIG_FIELD: &str = "Config";

pub type SecretFields = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
}

/// Remote key/value storage reachable through the cluster API. Every call is
/// a single attempt; callers own retries.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn put_secret(&self, name: &str, fields: &SecretFields) -> Result<(), StoreError>;

    async fn get_secret(&self, name: &str) -> Result<SecretFields, StoreError>;

    async fn put_config_blob(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    async fn get_config_blob(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Secret fields holding a record's PEM material and kubeconfig.
pub fn secret_fields(record: &CertificateRecord) -> Result<SecretFields, PkiError> {
    let mut fields = SecretFields::new();
    fields.insert(
        CERTIFICATE_FIELD.to_string(),
        record.certificate_pem()?.into_bytes(),
    );
    fields.insert(KEY_FIELD.to_string(), record.key_pem()?.into_bytes());
    if let Some(config) = &record.config {
        fields.insert(CONFIG_FIELD.to_string(), config.clone().into_bytes());
    }
    Ok(fields)
}

/// Rebuilds a record from its secret; metadata is derived from the name.
pub fn record_from_secret(
    name: &str,
    fields: &SecretFields,
    local_admin_config_path: &str,
) -> Result<CertificateRecord, PkiError> {
    let cert_type = CertificateType::from_name(name)
        .ok_or_else(|| PkiError::Parse(format!("unknown certificate name {}", name)))?;
    let field = |key: &str| {
        fields
            .get(key)
            .ok_or_else(|| PkiError::Parse(format!("secret {} has no {} field", name, key)))
    };

    let certificate = openssl::x509::X509::from_pem(field(CERTIFICATE_FIELD)?)?;
    let key = openssl::pkey::PKey::private_key_from_pem(field(KEY_FIELD)?)?;
    let config = match fields.get(CONFIG_FIELD) {
        Some(bytes) => Some(
            String::from_utf8(bytes.clone()).map_err(|e| PkiError::Parse(e.to_string()))?,
        ),
        None => None,
    };

    Ok(CertificateRecord::new(
        cert_type,
        certificate,
        key,
        config,
        local_admin_config_path,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_chain;

    #[test]
    fn record_survives_secret_encoding() {
        let chain = sample_chain(&["10.0.0.1"]);
        let admin = chain.get_type(CertificateType::Admin).unwrap();

        let fields = secret_fields(admin).unwrap();
        assert!(fields.contains_key(CONFIG_FIELD));
        let restored = record_from_secret("kube-admin", &fields, &admin.config_path).unwrap();
        assert_eq!(&restored, admin);
    }

    #[test]
    fn missing_field_is_a_parse_error() {
        let chain = sample_chain(&["10.0.0.1"]);
        let mut fields = secret_fields(chain.authority().unwrap()).unwrap();
        fields.remove(KEY_FIELD);

        assert!(matches!(
            record_from_secret("kube-ca", &fields, ""),
            Err(PkiError::Parse(_))
        ));
    }
}
