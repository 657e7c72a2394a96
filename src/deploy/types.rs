use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use super::ReconcileOutcome;

/// Label carrying [`ServiceSpec::spec_hash`] on created containers.
pub const SPEC_HASH_LABEL: &str = "io.kube-bootstrap.spec-hash";

/// Everything needed to create one service container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    /// First element becomes the container entrypoint, the rest lead the command.
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
    /// Appended to `args` as `--key=value`, in key order.
    pub extra_args: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub port_bindings: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: Option<String>,
    pub pid_mode: Option<String>,
    pub restart_policy: Option<String>,
    pub privileged: bool,
    /// Whether a running container with a different image gets rolled.
    pub upgrade_aware: bool,
}

impl ServiceSpec {
    /// Arguments passed after the image: the entrypoint tail, the fixed
    /// args, then the extra args.
    pub fn command(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .skip(1)
            .chain(self.args.iter())
            .cloned()
            .chain(
                self.extra_args
                    .iter()
                    .map(|(key, value)| format!("--{}={}", key, value)),
            )
            .collect()
    }

    /// Digest of everything that shapes the container; a container whose
    /// label differs has to be recreated.
    pub fn spec_hash(&self) -> String {
        let canonical = format!(
            "{:?}",
            (
                &self.image,
                self.entrypoint.first(),
                self.command(),
                &self.env,
                &self.binds,
                &self.port_bindings,
                &self.labels,
                &self.network_mode,
                &self.pid_mode,
                &self.restart_policy,
                self.privileged,
            )
        );
        hex::encode(openssl::sha::sha256(canonical.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub running: bool,
    /// `None` for containers created without the label.
    pub spec_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub running: bool,
}

impl ContainerSummary {
    /// Runtimes report names with a leading slash.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    NotRunning,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to run docker: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Command(String),
    #[error("unexpected runtime output: {0}")]
    Parse(String),
    #[error("container exited with status {0}")]
    NonZeroExit(i64),
    #[error("cancelled before start")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    Schedule,
    List,
    Inspect,
    Pull,
    Create,
    Start,
    Stop,
    Wait,
    Rename,
    Remove,
    Exit,
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            DeployStep::Schedule => "schedule",
            DeployStep::List => "list",
            DeployStep::Inspect => "inspect",
            DeployStep::Pull => "pull",
            DeployStep::Create => "create",
            DeployStep::Start => "start",
            DeployStep::Stop => "stop",
            DeployStep::Wait => "wait",
            DeployStep::Rename => "rename",
            DeployStep::Remove => "remove",
            DeployStep::Exit => "exit",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
#[error("failed to {step} container [{container}] on host [{host}]: {source}")]
pub struct DeployError {
    pub host: String,
    pub container: String,
    pub step: DeployStep,
    #[source]
    pub source: RuntimeError,
}

/// Result of deploying one plane: every unit's outcome or failure.
#[derive(Debug, Default)]
pub struct PlaneReport {
    pub plane: String,
    pub outcomes: Vec<UnitOutcome>,
    pub failures: Vec<DeployError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub host: String,
    pub container: String,
    pub outcome: ReconcileOutcome,
}

impl PlaneReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}
