//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::cert::{ChainRequest, TrustChain, TrustChainBuilder};
use crate::config::{HostRole, SystemDefaults};
use crate::deploy::MockContainerRuntime;
use crate::hosts::Host;

/// Defaults with small keys so chain generation stays fast.
pub fn test_defaults() -> SystemDefaults {
    SystemDefaults {
        key_size: 1024,
        ..Default::default()
    }
}

pub fn control_plane_host(address: &str) -> Host {
    Host::new(
        address,
        vec![HostRole::Controlplane],
        Arc::new(MockContainerRuntime::new()),
    )
}

pub fn sample_chain(addresses: &[&str]) -> TrustChain {
    let defaults = test_defaults();
    let hosts: Vec<Host> = addresses.iter().map(|a| control_plane_host(a)).collect();
    TrustChainBuilder::new(&defaults)
        .generate_chain(&ChainRequest {
            control_plane_hosts: &hosts,
            cluster_domain: "cluster.local",
            service_ip: "10.233.0.1".parse().unwrap(),
            local_admin_config_path: "./kube_config_cluster.yml",
        })
        .unwrap()
}
