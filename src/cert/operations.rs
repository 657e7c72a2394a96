// src/cert/operations.rs

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use tracing::{debug, info};

use super::openssl::{generate_ca_certificate, generate_private_key, sign_certificate};
use super::types::{
    AltNames, CertificateConfig, CertificateRecord, CertificateType, TrustChain,
};
use super::verification::verify_chain;
use super::PkiError;
use crate::config::SystemDefaults;
use crate::hosts::Host;
use crate::kubeconfig::KubeConfigGenerator;

const API_SERVER_DNS_ALIASES: [&str; 4] = [
    "localhost",
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
];

/// Cluster facts the chain is derived from.
#[derive(Debug, Clone, Copy)]
pub struct ChainRequest<'a> {
    pub control_plane_hosts: &'a [Host],
    pub cluster_domain: &'a str,
    pub service_ip: IpAddr,
    pub local_admin_config_path: &'a str,
}

/// Issues the cluster trust chain in-process. Holds no state between calls.
pub struct TrustChainBuilder<'a> {
    defaults: &'a SystemDefaults,
}

impl<'a> TrustChainBuilder<'a> {
    pub fn new(defaults: &'a SystemDefaults) -> Self {
        Self { defaults }
    }

    /// Generates a fresh authority and every leaf signed by it.
    pub fn generate_chain(&self, request: &ChainRequest<'_>) -> Result<TrustChain, PkiError> {
        if request.control_plane_hosts.is_empty() {
            return Err(PkiError::NoControlPlane);
        }
        info!(
            "[certificates] Generating trust chain for {} control plane host(s)",
            request.control_plane_hosts.len()
        );

        let authority = self.generate_authority()?;
        let mut records = BTreeMap::new();
        for cert_type in CertificateType::ALL {
            if cert_type.is_authority() {
                continue;
            }
            let record = self.generate_leaf(cert_type, &authority, request)?;
            records.insert(record.name.clone(), record);
        }
        records.insert(authority.name.clone(), authority);

        let chain = TrustChain::from_records(records);
        verify_chain(&chain)?;
        Ok(chain)
    }

    /// Regenerates `targets`, signing with the existing authority; every other
    /// record is carried over unchanged. Targeting the authority regenerates
    /// the whole chain.
    pub fn rotate(
        &self,
        existing: &TrustChain,
        targets: &BTreeSet<CertificateType>,
        request: &ChainRequest<'_>,
    ) -> Result<TrustChain, PkiError> {
        if targets.contains(&CertificateType::Authority) {
            info!("[certificates] Rotating cluster authority, regenerating every certificate");
            return self.generate_chain(request);
        }
        if request.control_plane_hosts.is_empty() {
            return Err(PkiError::NoControlPlane);
        }

        let authority = existing.authority()?.clone();
        let mut records = existing.clone().into_records();
        for cert_type in targets {
            info!("[certificates] Rotating {} certificate", cert_type);
            let record = self.generate_leaf(*cert_type, &authority, request)?;
            records.insert(record.name.clone(), record);
        }

        let chain = TrustChain::from_records(records);
        verify_chain(&chain)?;
        Ok(chain)
    }

    fn generate_authority(&self) -> Result<CertificateRecord, PkiError> {
        debug!("[certificates] Generating cluster authority");
        let config = CertificateConfig::for_type(
            CertificateType::Authority,
            self.defaults.ca_validity_days,
            self.defaults.key_size,
        );
        let key = generate_private_key(config.key_size)?;
        let certificate = generate_ca_certificate(&config, &key)?;
        Ok(CertificateRecord::new(
            CertificateType::Authority,
            certificate,
            key,
            None,
            "",
        ))
    }

    fn generate_leaf(
        &self,
        cert_type: CertificateType,
        authority: &CertificateRecord,
        request: &ChainRequest<'_>,
    ) -> Result<CertificateRecord, PkiError> {
        debug!("[certificates] Generating {} certificate", cert_type);

        let mut config = CertificateConfig::for_type(
            cert_type,
            self.defaults.leaf_validity_days,
            self.defaults.key_size,
        );
        if cert_type == CertificateType::ApiServer {
            config = config.with_alt_names(api_server_alt_names(
                request.control_plane_hosts,
                request.cluster_domain,
                request.service_ip,
            )?);
        }

        let key = generate_private_key(config.key_size)?;
        let certificate =
            sign_certificate(&config, &key, &authority.certificate, &authority.key)?;

        let mut record = CertificateRecord::new(
            cert_type,
            certificate,
            key,
            None,
            request.local_admin_config_path,
        );
        record.config = Some(self.render_kubeconfig(&record, authority, request)?);
        Ok(record)
    }

    fn render_kubeconfig(
        &self,
        record: &CertificateRecord,
        authority: &CertificateRecord,
        request: &ChainRequest<'_>,
    ) -> Result<String, PkiError> {
        let rendered = if record.name == CertificateType::Admin.name() {
            let first = request
                .control_plane_hosts
                .first()
                .ok_or(PkiError::NoControlPlane)?;
            KubeConfigGenerator::for_control_plane(&first.address).generate_with_data(
                &record.name,
                &authority.certificate_pem()?,
                &record.certificate_pem()?,
                &record.key_pem()?,
            )
        } else {
            KubeConfigGenerator::local().generate_with_paths(
                &record.name,
                &authority.path,
                &record.path,
                &record.key_path,
            )
        };
        rendered.map_err(|e| PkiError::Encoding(e.to_string()))
    }
}

/// Subject alternative names of the API server certificate: every control
/// plane address (then its advertise address when different) and hostname,
/// loopback, the service IP, and the in-cluster service names.
pub fn api_server_alt_names(
    control_plane_hosts: &[Host],
    cluster_domain: &str,
    service_ip: IpAddr,
) -> Result<AltNames, PkiError> {
    let mut alt_names = AltNames::default();

    for host in control_plane_hosts {
        alt_names.ips.push(parse_ip(&host.address)?);
        if !host.advertise_address.is_empty() && host.advertise_address != host.address {
            alt_names.ips.push(parse_ip(&host.advertise_address)?);
        }
        alt_names.dns_names.push(host.hostname.clone());
    }

    alt_names.ips.push(IpAddr::from([127, 0, 0, 1]));
    alt_names.ips.push(service_ip);

    alt_names
        .dns_names
        .extend(API_SERVER_DNS_ALIASES.iter().map(|s| s.to_string()));
    alt_names
        .dns_names
        .push(format!("kubernetes.default.svc.{}", cluster_domain));

    Ok(alt_names)
}

fn parse_ip(address: &str) -> Result<IpAddr, PkiError> {
    address.parse().map_err(|_| PkiError::InvalidAddress {
        address: address.to_string(),
    })
}
