// src/cert/inspect.rs
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::{CertificateRecord, PkiError, TrustChain};

#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    pub name: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: String,
    pub fingerprint: String,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl CertificateInfo {
    pub fn expires_within(&self, window: Duration) -> bool {
        self.not_after - Utc::now() < window
    }
}

pub fn analyze_certificate(record: &CertificateRecord) -> Result<CertificateInfo, PkiError> {
    let cert_der = record.certificate.to_der()?;
    let (_remainder, cert) =
        X509Certificate::from_der(&cert_der).map_err(|e| PkiError::Parse(e.to_string()))?;

    let not_before = timestamp(cert.validity().not_before.timestamp())?;
    let not_after = timestamp(cert.validity().not_after.timestamp())?;

    let mut is_ca = false;
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::BasicConstraints(bc) => is_ca = bc.ca,
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                ip_addresses.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Ok(CertificateInfo {
        name: record.name.clone(),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        serial: hex::encode(cert.raw_serial()),
        fingerprint: hex::encode(openssl::hash::hash(
            openssl::hash::MessageDigest::sha256(),
            &cert_der,
        )?),
        is_ca,
        dns_names,
        ip_addresses,
    })
}

/// Summaries of every record, in name order.
pub fn analyze_chain(chain: &TrustChain) -> Result<Vec<CertificateInfo>, PkiError> {
    chain.records().map(analyze_certificate).collect()
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, PkiError> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| PkiError::Parse(format!("invalid certificate timestamp {}", seconds)))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
