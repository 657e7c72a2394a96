// src/config/defaults.rs

/// Immutable registry of the values used when the cluster file leaves a field
/// blank. Built once at startup and passed by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemDefaults {
    pub etcd_image: String,
    pub kubernetes_image: String,
    pub cert_deployer_image: String,
    pub kubectl_image: String,
    pub infra_container_image: String,
    pub cluster_domain: String,
    pub service_cluster_ip_range: String,
    pub cluster_cidr: String,
    pub cluster_dns_server: String,
    pub network_plugin: String,
    pub ssh_key_path: String,
    pub ssh_user: String,
    pub ca_validity_days: u32,
    pub leaf_validity_days: u32,
    pub key_size: u32,
}

impl Default for SystemDefaults {
    fn default() -> Self {
        Self {
            etcd_image: "quay.io/coreos/etcd:latest".to_string(),
            kubernetes_image: "rancher/k8s:v1.8.3-rancher2".to_string(),
            cert_deployer_image: "rancher/rke-cert-deployer:0.1.0".to_string(),
            kubectl_image: "melsayed/kubectl:latest".to_string(),
            infra_container_image: "gcr.io/google_containers/pause-amd64:3.0".to_string(),
            cluster_domain: "cluster.local".to_string(),
            service_cluster_ip_range: "10.233.0.0/18".to_string(),
            cluster_cidr: "10.233.64.0/18".to_string(),
            cluster_dns_server: "10.233.0.3".to_string(),
            network_plugin: "flannel".to_string(),
            ssh_key_path: "~/.ssh/id_rsa".to_string(),
            ssh_user: "root".to_string(),
            ca_validity_days: 3650,
            leaf_validity_days: 365,
            key_size: 2048,
        }
    }
}
