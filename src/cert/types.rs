// cert/types.rs
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use super::PkiError;

pub const CERT_PATH_PREFIX: &str = "/etc/kubernetes/ssl";

pub const CA_CERT_NAME: &str = "kube-ca";
pub const KUBE_API_CERT_NAME: &str = "kube-apiserver";
pub const KUBE_CONTROLLER_CERT_NAME: &str = "kube-controller-manager";
pub const KUBE_SCHEDULER_CERT_NAME: &str = "kube-scheduler";
pub const KUBE_PROXY_CERT_NAME: &str = "kube-proxy";
pub const KUBE_NODE_CERT_NAME: &str = "kube-node";
pub const KUBE_ADMIN_CERT_NAME: &str = "kube-admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CertificateType {
    Authority,
    ApiServer,
    ControllerManager,
    Scheduler,
    Proxy,
    Node,
    Admin,
}

impl CertificateType {
    pub const ALL: [CertificateType; 7] = [
        CertificateType::Authority,
        CertificateType::ApiServer,
        CertificateType::ControllerManager,
        CertificateType::Scheduler,
        CertificateType::Proxy,
        CertificateType::Node,
        CertificateType::Admin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CertificateType::Authority => CA_CERT_NAME,
            CertificateType::ApiServer => KUBE_API_CERT_NAME,
            CertificateType::ControllerManager => KUBE_CONTROLLER_CERT_NAME,
            CertificateType::Scheduler => KUBE_SCHEDULER_CERT_NAME,
            CertificateType::Proxy => KUBE_PROXY_CERT_NAME,
            CertificateType::Node => KUBE_NODE_CERT_NAME,
            CertificateType::Admin => KUBE_ADMIN_CERT_NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Maps a service or container name from a rotation request to the
    /// certificate that service presents.
    pub fn for_service(service: &str) -> Option<Self> {
        match service {
            "kube-api" | "kube-apiserver" => Some(CertificateType::ApiServer),
            "kube-controller" | "kube-controller-manager" => {
                Some(CertificateType::ControllerManager)
            }
            "scheduler" | "kube-scheduler" => Some(CertificateType::Scheduler),
            "kubeproxy" | "kube-proxy" => Some(CertificateType::Proxy),
            "kubelet" | "kube-node" => Some(CertificateType::Node),
            "kube-admin" => Some(CertificateType::Admin),
            "kube-ca" => Some(CertificateType::Authority),
            _ => None,
        }
    }

    pub fn common_name(self) -> &'static str {
        match self {
            CertificateType::Authority => CA_CERT_NAME,
            CertificateType::ApiServer => KUBE_API_CERT_NAME,
            CertificateType::ControllerManager => "system:kube-controller-manager",
            CertificateType::Scheduler => "system:kube-scheduler",
            CertificateType::Proxy => "system:kube-proxy",
            CertificateType::Node => "system:node",
            CertificateType::Admin => KUBE_ADMIN_CERT_NAME,
        }
    }

    /// RBAC group carried in the subject O attribute.
    pub fn organization(self) -> Option<&'static str> {
        match self {
            CertificateType::Node => Some("system:nodes"),
            CertificateType::Admin => Some("system:masters"),
            _ => None,
        }
    }

    pub fn is_authority(self) -> bool {
        self == CertificateType::Authority
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    ServerAuth,
    ClientAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltNames {
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
}

impl AltNames {
    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty() && self.ips.is_empty()
    }
}

/// Parameters for issuing one certificate.
#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub cert_type: CertificateType,
    pub common_name: String,
    pub organization: Option<String>,
    pub validity_days: u32,
    pub key_size: u32,
    pub alt_names: AltNames,
    pub extended_key_usage: Vec<KeyPurpose>,
}

impl CertificateConfig {
    pub fn for_type(cert_type: CertificateType, validity_days: u32, key_size: u32) -> Self {
        let extended_key_usage = match cert_type {
            CertificateType::Authority => Vec::new(),
            CertificateType::ApiServer => vec![KeyPurpose::ServerAuth, KeyPurpose::ClientAuth],
            _ => vec![KeyPurpose::ClientAuth],
        };
        Self {
            cert_type,
            common_name: cert_type.common_name().to_string(),
            organization: cert_type.organization().map(str::to_string),
            validity_days,
            key_size,
            alt_names: AltNames::default(),
            extended_key_usage,
        }
    }

    pub fn with_alt_names(mut self, alt_names: AltNames) -> Self {
        self.alt_names = alt_names;
        self
    }
}

/// One identity of the trust chain: certificate, key, optional kubeconfig,
/// and where they land on hosts.
#[derive(Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub name: String,
    #[serde(rename = "certificate_pem", with = "pem::certificate")]
    pub certificate: X509,
    #[serde(rename = "key_pem", with = "pem::private_key")]
    pub key: PKey<Private>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    pub path: String,
    pub key_path: String,
    pub config_path: String,
    pub env_name: String,
    pub key_env_name: String,
    pub config_env_name: String,
}

impl CertificateRecord {
    /// Wraps issued material with the metadata derived from its role. The
    /// admin kubeconfig lives at `local_admin_config_path` on the operator's
    /// machine instead of under the host certificate directory.
    pub fn new(
        cert_type: CertificateType,
        certificate: X509,
        key: PKey<Private>,
        config: Option<String>,
        local_admin_config_path: &str,
    ) -> Self {
        let name = cert_type.name();
        let config_path = if cert_type == CertificateType::Admin {
            local_admin_config_path.to_string()
        } else {
            config_file_path(name)
        };
        Self {
            name: name.to_string(),
            certificate,
            key,
            config,
            common_name: cert_type.common_name().to_string(),
            organization: cert_type.organization().map(str::to_string),
            path: cert_file_path(name),
            key_path: key_file_path(name),
            config_path,
            env_name: env_var_name(name),
            key_env_name: format!("{}_KEY", env_var_name(name)),
            config_env_name: format!("KUBECFG_{}", env_var_name(name)),
        }
    }

    pub fn cert_type(&self) -> Option<CertificateType> {
        CertificateType::from_name(&self.name)
    }

    pub fn certificate_pem(&self) -> Result<String, PkiError> {
        let pem = self.certificate.to_pem()?;
        String::from_utf8(pem).map_err(|e| PkiError::Encoding(e.to_string()))
    }

    /// PKCS#1 encoding of the RSA key.
    pub fn key_pem(&self) -> Result<String, PkiError> {
        let pem = self.key.rsa()?.private_key_to_pem()?;
        String::from_utf8(pem).map_err(|e| PkiError::Encoding(e.to_string()))
    }
}

impl PartialEq for CertificateRecord {
    fn eq(&self, other: &Self) -> bool {
        let same_material = match (
            self.certificate.to_der(),
            other.certificate.to_der(),
            self.key.private_key_to_der(),
            other.key.private_key_to_der(),
        ) {
            (Ok(a), Ok(b), Ok(ka), Ok(kb)) => a == b && ka == kb,
            _ => false,
        };
        same_material
            && self.name == other.name
            && self.config == other.config
            && self.common_name == other.common_name
            && self.organization == other.organization
            && self.path == other.path
            && self.key_path == other.key_path
            && self.config_path == other.config_path
            && self.env_name == other.env_name
            && self.key_env_name == other.key_env_name
            && self.config_env_name == other.config_env_name
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("name", &self.name)
            .field("common_name", &self.common_name)
            .field("organization", &self.organization)
            .field("path", &self.path)
            .field("has_config", &self.config.is_some())
            .finish_non_exhaustive()
    }
}

pub fn cert_file_path(name: &str) -> String {
    format!("{}/{}.pem", CERT_PATH_PREFIX, name)
}

pub fn key_file_path(name: &str) -> String {
    format!("{}/{}-key.pem", CERT_PATH_PREFIX, name)
}

pub fn config_file_path(name: &str) -> String {
    format!("{}/kubecfg-{}.yaml", CERT_PATH_PREFIX, name)
}

fn env_var_name(name: &str) -> String {
    name.replace('-', "_").to_uppercase()
}

/// The complete set of cluster identities, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustChain {
    records: BTreeMap<String, CertificateRecord>,
}

impl TrustChain {
    pub(crate) fn from_records(records: BTreeMap<String, CertificateRecord>) -> Self {
        Self { records }
    }

    pub fn get(&self, name: &str) -> Option<&CertificateRecord> {
        self.records.get(name)
    }

    pub fn get_type(&self, cert_type: CertificateType) -> Option<&CertificateRecord> {
        self.get(cert_type.name())
    }

    pub fn authority(&self) -> Result<&CertificateRecord, PkiError> {
        self.get(CA_CERT_NAME)
            .ok_or_else(|| PkiError::MissingCertificate(CA_CERT_NAME.to_string()))
    }

    pub fn records(&self) -> impl Iterator<Item = &CertificateRecord> {
        self.records.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when every cluster identity is present.
    pub fn is_complete(&self) -> bool {
        CertificateType::ALL
            .iter()
            .all(|t| self.records.contains_key(t.name()))
    }

    pub(crate) fn into_records(self) -> BTreeMap<String, CertificateRecord> {
        self.records
    }
}

mod pem {
    pub mod certificate {
        use openssl::x509::X509;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(cert: &X509, serializer: S) -> Result<S::Ok, S::Error> {
            let pem = cert.to_pem().map_err(<S::Error as serde::ser::Error>::custom)?;
            let pem = String::from_utf8(pem).map_err(<S::Error as serde::ser::Error>::custom)?;
            serializer.serialize_str(&pem)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<X509, D::Error> {
            let pem = String::deserialize(deserializer)?;
            X509::from_pem(pem.as_bytes()).map_err(<D::Error as serde::de::Error>::custom)
        }
    }

    pub mod private_key {
        use openssl::pkey::{PKey, Private};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            key: &PKey<Private>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            let rsa = key.rsa().map_err(<S::Error as serde::ser::Error>::custom)?;
            let pem = rsa
                .private_key_to_pem()
                .map_err(<S::Error as serde::ser::Error>::custom)?;
            let pem = String::from_utf8(pem).map_err(<S::Error as serde::ser::Error>::custom)?;
            serializer.serialize_str(&pem)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<PKey<Private>, D::Error> {
            let pem = String::deserialize(deserializer)?;
            PKey::private_key_from_pem(pem.as_bytes()).map_err(<D::Error as serde::de::Error>::custom)
        }
    }
}
