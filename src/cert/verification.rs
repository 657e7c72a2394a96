// src/cert/verification.rs
use tracing::debug;

use super::openssl::verify_certificate;
use super::types::{CertificateType, TrustChain};
use super::{CertificateRecord, PkiError};

/// Checks that `record` was issued and signed by `authority`. The authority
/// itself must be self-signed.
pub fn verify_record(
    record: &CertificateRecord,
    authority: &CertificateRecord,
) -> Result<(), PkiError> {
    if !verify_certificate(&record.certificate, &authority.certificate)? {
        return Err(PkiError::Verification(record.name.clone()));
    }
    Ok(())
}

/// Validates every record of a chain against its authority and requires all
/// cluster identities to be present.
pub fn verify_chain(chain: &TrustChain) -> Result<(), PkiError> {
    let authority = chain.authority()?;
    for cert_type in CertificateType::ALL {
        let record = chain
            .get_type(cert_type)
            .ok_or_else(|| PkiError::MissingCertificate(cert_type.name().to_string()))?;
        verify_record(record, authority)?;
        debug!("[certificates] {} validates against {}", record.name, authority.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_chain;
    use std::collections::BTreeMap;

    #[test]
    fn generated_chain_verifies() {
        let chain = sample_chain(&["10.0.0.1"]);
        verify_chain(&chain).unwrap();
    }

    #[test]
    fn leaf_from_another_chain_is_rejected() {
        let chain = sample_chain(&["10.0.0.1"]);
        let foreign = sample_chain(&["10.0.0.1"]);

        let mut records: BTreeMap<String, CertificateRecord> = chain
            .records()
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        let foreign_node = foreign.get_type(CertificateType::Node).unwrap().clone();
        records.insert(foreign_node.name.clone(), foreign_node);

        let mixed = TrustChain::from_records(records);
        match verify_chain(&mixed) {
            Err(PkiError::Verification(name)) => assert_eq!(name, "kube-node"),
            other => panic!("expected verification failure, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_chain_is_rejected() {
        let chain = sample_chain(&["10.0.0.1"]);
        let records: BTreeMap<String, CertificateRecord> = chain
            .records()
            .filter(|r| r.name != "kube-proxy")
            .map(|r| (r.name.clone(), r.clone()))
            .collect();

        let partial = TrustChain::from_records(records);
        assert!(matches!(
            verify_chain(&partial),
            Err(PkiError::MissingCertificate(name)) if name == "kube-proxy"
        ));
    }
}
