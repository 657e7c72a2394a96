//! Container deployment: the runtime abstraction, the rolling deployer, and
//! the service definitions for every cluster plane.

pub mod docker;
mod rolling;
pub mod services;
mod types;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub use rolling::{ReconcileOutcome, RollingDeployer, OLD_CONTAINER_PREFIX};
pub use types::{
    ContainerInfo, ContainerSummary, DeployError, DeployStep, PlaneReport, RuntimeError,
    ServiceSpec, UnitOutcome, WaitCondition, SPEC_HASH_LABEL,
};

/// Container operations on a single host.
///
/// Every call is remote and fallible; implementations must not retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates (but does not start) a container and returns its id.
    async fn create(&self, name: &str, spec: &ServiceSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError>;

    /// All containers on the host, running or not.
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Blocks until `condition` holds and returns the exit code.
    async fn wait(&self, id: &str, condition: WaitCondition) -> Result<i64, RuntimeError>;
}
