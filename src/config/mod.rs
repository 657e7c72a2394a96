mod defaults;
mod types;

pub use defaults::SystemDefaults;
pub use types::{
    ClusterConfig, ConfigError, HostConfig, HostRole, KubeApiConfig, KubeControllerConfig,
    KubeletConfig, NetworkConfig, RotateCertificates, ServiceConfig, ServicesConfig,
};
