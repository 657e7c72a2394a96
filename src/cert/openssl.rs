// src/cert/openssl.rs
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509Ref, X509VerifyResult, X509};
use tracing::debug;

use super::types::{CertificateConfig, KeyPurpose};

pub fn generate_private_key(key_size: u32) -> Result<PKey<Private>, ErrorStack> {
    let rsa = Rsa::generate(key_size)?;
    PKey::from_rsa(rsa)
}

fn build_subject(config: &CertificateConfig) -> Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    if let Some(organization) = &config.organization {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
    }
    name.append_entry_by_nid(Nid::COMMONNAME, &config.common_name)?;
    Ok(name.build())
}

fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn new_builder(config: &CertificateConfig, key: &PKeyRef<Private>) -> Result<X509Builder, ErrorStack> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    let subject = build_subject(config)?;
    builder.set_subject_name(&subject)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(config.validity_days)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

/// Issues a self-signed authority certificate for `key`.
pub fn generate_ca_certificate(
    config: &CertificateConfig,
    key: &PKeyRef<Private>,
) -> Result<X509, ErrorStack> {
    debug!("Generating CA certificate: {}", config.common_name);

    let mut builder = new_builder(config, key)?;
    let subject = build_subject(config)?;
    builder.set_issuer_name(&subject)?;

    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    let subject_key_id =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Issues a leaf certificate for `key`, signed by the authority.
pub fn sign_certificate(
    config: &CertificateConfig,
    key: &PKeyRef<Private>,
    ca_cert: &X509Ref,
    ca_key: &PKeyRef<Private>,
) -> Result<X509, ErrorStack> {
    debug!("Signing certificate: {}", config.common_name);

    let mut builder = new_builder(config, key)?;
    builder.set_issuer_name(ca_cert.subject_name())?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;

    let mut usage = ExtendedKeyUsage::new();
    for purpose in &config.extended_key_usage {
        match purpose {
            KeyPurpose::ServerAuth => usage.server_auth(),
            KeyPurpose::ClientAuth => usage.client_auth(),
        };
    }
    builder.append_extension(usage.build()?)?;

    if !config.alt_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in &config.alt_names.dns_names {
            san.dns(dns);
        }
        for ip in &config.alt_names.ips {
            san.ip(&ip.to_string());
        }
        let san = san.build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(san)?;
    }

    builder.sign(ca_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// True when `cert` names `ca` as issuer and carries a valid signature from it.
pub fn verify_certificate(cert: &X509Ref, ca: &X509Ref) -> Result<bool, ErrorStack> {
    if ca.issued(cert) != X509VerifyResult::OK {
        return Ok(false);
    }
    let ca_key = ca.public_key()?;
    cert.verify(&ca_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::types::{AltNames, CertificateType};

    fn ca() -> (X509, PKey<Private>) {
        let config = CertificateConfig::for_type(CertificateType::Authority, 3650, 1024);
        let key = generate_private_key(1024).unwrap();
        let cert = generate_ca_certificate(&config, &key).unwrap();
        (cert, key)
    }

    #[test]
    fn leaf_verifies_against_its_authority_only() {
        let (ca_cert, ca_key) = ca();
        let (other_ca, _) = ca();

        let config = CertificateConfig::for_type(CertificateType::Scheduler, 365, 1024);
        let key = generate_private_key(1024).unwrap();
        let leaf = sign_certificate(&config, &key, &ca_cert, &ca_key).unwrap();

        assert!(verify_certificate(&leaf, &ca_cert).unwrap());
        assert!(!verify_certificate(&leaf, &other_ca).unwrap());
        assert!(verify_certificate(&ca_cert, &ca_cert).unwrap());
    }

    #[test]
    fn subject_carries_group_as_organization() {
        let (ca_cert, ca_key) = ca();
        let config = CertificateConfig::for_type(CertificateType::Admin, 365, 1024);
        let key = generate_private_key(1024).unwrap();
        let leaf = sign_certificate(&config, &key, &ca_cert, &ca_key).unwrap();

        let entry = |nid| {
            leaf.subject_name()
                .entries_by_nid(nid)
                .next()
                .unwrap()
                .data()
                .as_utf8()
                .unwrap()
                .to_string()
        };
        assert_eq!(entry(Nid::COMMONNAME), "kube-admin");
        assert_eq!(entry(Nid::ORGANIZATIONNAME), "system:masters");
    }

    #[test]
    fn alt_names_are_embedded() {
        let (ca_cert, ca_key) = ca();
        let config = CertificateConfig::for_type(CertificateType::ApiServer, 365, 1024)
            .with_alt_names(AltNames {
                dns_names: vec!["kubernetes".to_string()],
                ips: vec!["10.0.0.1".parse().unwrap()],
            });
        let key = generate_private_key(1024).unwrap();
        let leaf = sign_certificate(&config, &key, &ca_cert, &ca_key).unwrap();

        let names = leaf.subject_alt_names().unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names.get(0).unwrap().dnsname(), Some("kubernetes"));
        assert_eq!(names.get(1).unwrap().ipaddress(), Some(&[10u8, 0, 0, 1][..]));
    }
}
