use std::fmt;
use std::sync::Arc;

use crate::config::{HostConfig, HostRole};
use crate::deploy::ContainerRuntime;

/// A cluster machine together with the runtime used to reach it.
#[derive(Clone)]
pub struct Host {
    pub address: String,
    pub advertise_address: String,
    pub hostname: String,
    pub roles: Vec<HostRole>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl Host {
    pub fn new(
        address: impl Into<String>,
        roles: Vec<HostRole>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let address = address.into();
        Self {
            advertise_address: address.clone(),
            hostname: address.clone(),
            address,
            roles,
            runtime,
        }
    }

    /// Builds a host from its config entry; blank advertise address and
    /// hostname fall back to the address.
    pub fn from_config(config: &HostConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let mut host = Self::new(config.address.clone(), config.role.clone(), runtime);
        if !config.advertise_address.is_empty() {
            host.advertise_address = config.advertise_address.clone();
        }
        if !config.hostname.is_empty() {
            host.hostname = config.hostname.clone();
        }
        host
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = address.into();
        self
    }

    pub fn has_role(&self, role: HostRole) -> bool {
        self.roles.contains(&role)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("advertise_address", &self.advertise_address)
            .field("hostname", &self.hostname)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

pub fn hosts_with_role(hosts: &[Host], role: HostRole) -> Vec<Host> {
    hosts.iter().filter(|h| h.has_role(role)).cloned().collect()
}
