mod kube;
mod types;

pub use kube::{
    load_kubeconfig, write_kubeconfig, KubeConfigGenerator, KUBE_API_PORT, LOCAL_API_SERVER,
};
pub use types::{ClusterEntry, ContextEntry, KubeConfig, NamedCluster, NamedContext, NamedUser, UserEntry};
