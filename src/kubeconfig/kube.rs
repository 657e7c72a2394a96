use base64::{engine::general_purpose::STANDARD, Engine};
use std::fs;
use std::io;
use std::path::Path;

use super::types::{
    ClusterEntry, ContextEntry, KubeConfig, NamedCluster, NamedContext, NamedUser, UserEntry,
};

pub const KUBE_API_PORT: u16 = 6443;
pub const LOCAL_API_SERVER: &str = "https://127.0.0.1:6443";

const CLUSTER_NAME: &str = "local";
const CONTEXT_NAME: &str = "Default";

/// Renders kubeconfig files pointing at one API server endpoint.
pub struct KubeConfigGenerator {
    server: String,
}

impl KubeConfigGenerator {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }

    /// Endpoint reachable from every control plane and worker host.
    pub fn local() -> Self {
        Self::new(LOCAL_API_SERVER)
    }

    pub fn for_control_plane(address: &str) -> Self {
        Self::new(format!("https://{}:{}", address, KUBE_API_PORT))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Kubeconfig referencing certificate files already present on the host.
    pub fn generate_with_paths(
        &self,
        component: &str,
        ca_path: &str,
        cert_path: &str,
        key_path: &str,
    ) -> Result<String, serde_yaml::Error> {
        let cluster = ClusterEntry {
            server: self.server.clone(),
            certificate_authority: Some(ca_path.to_string()),
            certificate_authority_data: None,
        };
        let user = UserEntry {
            client_certificate: Some(cert_path.to_string()),
            client_key: Some(key_path.to_string()),
            ..Default::default()
        };
        serde_yaml::to_string(&self.build(component, cluster, user))
    }

    /// Self-contained kubeconfig with the PEM material embedded as base64.
    pub fn generate_with_data(
        &self,
        component: &str,
        ca_pem: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<String, serde_yaml::Error> {
        let cluster = ClusterEntry {
            server: self.server.clone(),
            certificate_authority: None,
            certificate_authority_data: Some(STANDARD.encode(ca_pem)),
        };
        let user = UserEntry {
            client_certificate_data: Some(STANDARD.encode(cert_pem)),
            client_key_data: Some(STANDARD.encode(key_pem)),
            ..Default::default()
        };
        serde_yaml::to_string(&self.build(component, cluster, user))
    }

    fn build(&self, component: &str, cluster: ClusterEntry, user: UserEntry) -> KubeConfig {
        KubeConfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CLUSTER_NAME.to_string(),
                cluster,
            }],
            users: vec![NamedUser {
                name: component.to_string(),
                user,
            }],
            contexts: vec![NamedContext {
                name: CONTEXT_NAME.to_string(),
                context: ContextEntry {
                    cluster: CLUSTER_NAME.to_string(),
                    user: component.to_string(),
                },
            }],
            current_context: CONTEXT_NAME.to_string(),
        }
    }
}

pub fn load_kubeconfig(path: &Path) -> io::Result<KubeConfig> {
    let content = fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes a kubeconfig readable only by the owner.
pub fn write_kubeconfig(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_kubeconfig_targets_local_endpoint() {
        let yaml = KubeConfigGenerator::local()
            .generate_with_paths(
                "kube-node",
                "/etc/kubernetes/ssl/kube-ca.pem",
                "/etc/kubernetes/ssl/kube-node.pem",
                "/etc/kubernetes/ssl/kube-node-key.pem",
            )
            .unwrap();
        let config: KubeConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(config.server(), Some("https://127.0.0.1:6443"));
        assert_eq!(
            config.clusters[0].cluster.certificate_authority.as_deref(),
            Some("/etc/kubernetes/ssl/kube-ca.pem")
        );
        assert_eq!(config.users[0].name, "kube-node");
        assert!(yaml.contains("current-context: Default"));
        assert!(yaml.contains("apiVersion: v1"));
    }

    #[test]
    fn data_kubeconfig_embeds_base64_material() {
        let yaml = KubeConfigGenerator::for_control_plane("1.1.1.1")
            .generate_with_data("kube-admin", "CA", "CERT", "KEY")
            .unwrap();
        let config: KubeConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(config.server(), Some("https://1.1.1.1:6443"));
        let user = &config.users[0].user;
        assert_eq!(user.client_certificate_data.as_deref(), Some("Q0VSVA=="));
        assert_eq!(user.client_key_data.as_deref(), Some("S0VZ"));
        assert!(user.client_certificate.is_none());
    }

    #[test]
    fn write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kube_config_cluster.yml");
        let yaml = KubeConfigGenerator::local()
            .generate_with_data("kube-admin", "CA", "CERT", "KEY")
            .unwrap();

        write_kubeconfig(&path, &yaml).unwrap();
        let loaded = load_kubeconfig(&path).unwrap();
        assert_eq!(loaded.server(), Some(LOCAL_API_SERVER));
    }
}
