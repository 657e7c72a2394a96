// config/types.rs
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::{fs, io, path::Path};
use thiserror::Error;

use super::SystemDefaults;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cluster file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse cluster file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid cluster config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Etcd,
    Controlplane,
    Worker,
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRole::Etcd => write!(f, "etcd"),
            HostRole::Controlplane => write!(f, "controlplane"),
            HostRole::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub advertise_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default)]
    pub role: Vec<HostRole>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_socket: String,
    /// Private key for SSH; the cluster-wide key when blank.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_path: String,
}

impl HostConfig {
    pub fn has_role(&self, role: HostRole) -> bool {
        self.role.contains(&role)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeApiConfig {
    #[serde(flatten)]
    pub base: ServiceConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_cluster_ip_range: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeControllerConfig {
    #[serde(flatten)]
    pub base: ServiceConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_cidr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_cluster_ip_range: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeletConfig {
    #[serde(flatten)]
    pub base: ServiceConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_dns_server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub infra_container_image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub etcd: ServiceConfig,
    #[serde(default)]
    pub kube_api: KubeApiConfig,
    #[serde(default)]
    pub kube_controller: KubeControllerConfig,
    #[serde(default)]
    pub scheduler: ServiceConfig,
    #[serde(default)]
    pub kubelet: KubeletConfig,
    #[serde(default)]
    pub kubeproxy: ServiceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin: String,
    /// Rendered manifest applied by the network-plugin job. Templating it is
    /// left to whoever writes the cluster file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

/// Certificate rotation request. `services` takes container or certificate
/// names (`kube-apiserver`, `kubelet`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotateCertificates {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub ca: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<HostConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_domain: String,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_certificates: Option<RotateCertificates>,
}

impl ClusterConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(config_str)?)
    }

    /// Fills every blank field from `defaults`. Idempotent.
    pub fn apply_defaults(&mut self, defaults: &SystemDefaults) {
        fill(&mut self.cluster_domain, &defaults.cluster_domain);
        fill(&mut self.ssh_key_path, &defaults.ssh_key_path);
        fill(&mut self.network.plugin, &defaults.network_plugin);

        for node in &mut self.nodes {
            fill(&mut node.advertise_address, &node.address);
            fill(&mut node.hostname, &node.address);
            fill(&mut node.user, &defaults.ssh_user);
            fill(&mut node.ssh_key_path, &self.ssh_key_path);
        }

        let services = &mut self.services;
        fill(&mut services.etcd.image, &defaults.etcd_image);
        fill(&mut services.kube_api.base.image, &defaults.kubernetes_image);
        fill(
            &mut services.kube_api.service_cluster_ip_range,
            &defaults.service_cluster_ip_range,
        );
        fill(&mut services.kube_controller.base.image, &defaults.kubernetes_image);
        fill(&mut services.kube_controller.cluster_cidr, &defaults.cluster_cidr);
        fill(
            &mut services.kube_controller.service_cluster_ip_range,
            &defaults.service_cluster_ip_range,
        );
        fill(&mut services.scheduler.image, &defaults.kubernetes_image);
        fill(&mut services.kubelet.base.image, &defaults.kubernetes_image);
        fill(&mut services.kubelet.cluster_domain, &self.cluster_domain);
        fill(&mut services.kubelet.cluster_dns_server, &defaults.cluster_dns_server);
        fill(
            &mut services.kubelet.infra_container_image,
            &defaults.infra_container_image,
        );
        fill(&mut services.kubeproxy.image, &defaults.kubernetes_image);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_plane_hosts().is_empty() {
            return Err(ConfigError::Invalid(
                "cluster must have at least one control plane host".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.address.trim().is_empty() {
                return Err(ConfigError::Invalid("node address must not be empty".to_string()));
            }
            if node.role.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "node {} has no roles",
                    node.address
                )));
            }
            if !seen.insert(node.address.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "node {} is listed more than once",
                    node.address
                )));
            }
        }

        self.service_ip()?;
        if !self.services.kube_controller.cluster_cidr.is_empty() {
            parse_cidr(&self.services.kube_controller.cluster_cidr)?;
        }
        Ok(())
    }

    pub fn hosts_with_role(&self, role: HostRole) -> Vec<&HostConfig> {
        self.nodes.iter().filter(|n| n.has_role(role)).collect()
    }

    pub fn control_plane_hosts(&self) -> Vec<&HostConfig> {
        self.hosts_with_role(HostRole::Controlplane)
    }

    /// First usable address of the service cluster IP range; the in-cluster
    /// address of the API server.
    pub fn service_ip(&self) -> Result<IpAddr, ConfigError> {
        let (network, _) = parse_cidr(&self.services.kube_api.service_cluster_ip_range)?;
        let first = u32::from(network).checked_add(1).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "service cluster ip range {} has no usable address",
                self.services.kube_api.service_cluster_ip_range
            ))
        })?;
        Ok(IpAddr::V4(Ipv4Addr::from(first)))
    }
}

fn fill(field: &mut String, value: &str) {
    if field.trim().is_empty() {
        *field = value.to_string();
    }
}

/// Parses an IPv4 CIDR and returns its network address and prefix length.
fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("invalid CIDR: {:?}", cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 30 {
        return Err(invalid());
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok((Ipv4Addr::from(u32::from(addr) & mask), prefix))
}
