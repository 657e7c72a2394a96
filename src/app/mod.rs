mod manager;

pub use manager::{
    default_kubeconfig_path, ClusterManager, ManagerOptions, RuntimeFactory, StoreFactory,
};
