// src/deploy/docker.rs
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSummary, RuntimeError, ServiceSpec, WaitCondition,
    SPEC_HASH_LABEL,
};
use crate::config::HostConfig;

const INSPECT_FORMAT: &str =
    "{{.Id}}|{{.Config.Image}}|{{.State.Running}}|{{index .Config.Labels \"io.kube-bootstrap.spec-hash\"}}";
const PS_FORMAT: &str = "{{.ID}}|{{.Names}}|{{.State}}";

/// How `docker` reaches a node's daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transport {
    /// `docker -H <endpoint>` from this machine.
    Endpoint(String),
    /// `docker` run on the node itself through `ssh`.
    Ssh {
        destination: String,
        identity: Option<String>,
    },
}

/// Drives a host's Docker daemon through the `docker` CLI, over SSH unless
/// the node names a socket.
#[derive(Debug, Clone)]
pub struct DockerCli {
    transport: Transport,
    docker: String,
}

impl DockerCli {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            transport: Transport::Endpoint(endpoint.into()),
            docker: "docker".to_string(),
        }
    }

    pub fn for_host(host: &HostConfig) -> Self {
        if host.docker_socket.contains("://") {
            return Self::new(host.docker_socket.clone());
        }
        let destination = if host.user.is_empty() {
            host.address.clone()
        } else {
            format!("{}@{}", host.user, host.address)
        };
        let identity = (!host.ssh_key_path.is_empty())
            .then(|| shellexpand::tilde(&host.ssh_key_path).into_owned());
        Self {
            transport: Transport::Ssh {
                destination,
                identity,
            },
            docker: "docker".to_string(),
        }
    }

    /// Program and arguments that run `docker args` against the node.
    fn command_line(&self, args: &[String]) -> (String, Vec<String>) {
        match &self.transport {
            Transport::Endpoint(endpoint) => {
                let mut line = vec!["-H".to_string(), endpoint.clone()];
                line.extend(args.iter().cloned());
                (self.docker.clone(), line)
            }
            Transport::Ssh {
                destination,
                identity,
            } => {
                let mut line = owned(&["-o", "BatchMode=yes"]);
                if let Some(identity) = identity {
                    line.push("-i".to_string());
                    line.push(identity.clone());
                }
                line.push(destination.clone());
                line.push("--".to_string());
                let remote: Vec<String> = std::iter::once(self.docker.as_str())
                    .chain(args.iter().map(String::as_str))
                    .map(shell_quote)
                    .collect();
                line.push(remote.join(" "));
                ("ssh".to_string(), line)
            }
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String, RuntimeError> {
        let (program, line) = self.command_line(args);
        debug!("Running {} {}", program, line.join(" "));
        let output = Command::new(&program).args(&line).output().await?;

        if !output.status.success() {
            return Err(RuntimeError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Quotes one word for the remote POSIX shell.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_=./:,@%+".contains(&b));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn create_args(name: &str, spec: &ServiceSpec) -> Vec<String> {
    let mut args = owned(&["create", "--name", name]);
    if let Some(policy) = &spec.restart_policy {
        args.push(format!("--restart={}", policy));
    }
    if let Some(mode) = &spec.network_mode {
        args.push(format!("--network={}", mode));
    }
    if let Some(mode) = &spec.pid_mode {
        args.push(format!("--pid={}", mode));
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    for bind in &spec.binds {
        args.push("-v".to_string());
        args.push(bind.clone());
    }
    for port in &spec.port_bindings {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    for env in &spec.env {
        args.push("-e".to_string());
        args.push(env.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--label".to_string());
    args.push(format!("{}={}", SPEC_HASH_LABEL, spec.spec_hash()));
    if let Some(entrypoint) = spec.entrypoint.first() {
        args.push(format!("--entrypoint={}", entrypoint));
    }
    args.push(spec.image.clone());
    args.extend(spec.command());
    args
}

fn parse_inspect(output: &str) -> Result<ContainerInfo, RuntimeError> {
    let line = output.trim();
    let mut parts = line.splitn(4, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(image), Some(running)) if !id.is_empty() => Ok(ContainerInfo {
            id: id.to_string(),
            image: image.to_string(),
            running: running == "true",
            spec_hash: parts
                .next()
                .map(str::trim)
                .filter(|hash| !hash.is_empty() && *hash != "<no value>")
                .map(str::to_string),
        }),
        _ => Err(RuntimeError::Parse(line.to_string())),
    }
}

fn parse_ps(output: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.trim().splitn(3, '|').collect();
            match fields.as_slice() {
                [id, names, state] => Ok(ContainerSummary {
                    id: id.to_string(),
                    names: names.split(',').map(str::to_string).collect(),
                    running: *state == "running",
                }),
                _ => Err(RuntimeError::Parse(line.to_string())),
            }
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker(&owned(&["pull", image])).await.map(|_| ())
    }

    async fn create(&self, name: &str, spec: &ServiceSpec) -> Result<String, RuntimeError> {
        let stdout = self.docker(&create_args(name, spec)).await?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(RuntimeError::Parse("docker create returned no id".to_string()));
        }
        Ok(id.to_string())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker(&owned(&["start", id])).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker(&owned(&["stop", id])).await.map(|_| ())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RuntimeError> {
        self.docker(&owned(&["rename", from, to])).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker(&owned(&["rm", "-f", id])).await.map(|_| ())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let stdout = self
            .docker(&owned(&["inspect", "--format", INSPECT_FORMAT, name]))
            .await?;
        parse_inspect(&stdout)
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let stdout = self
            .docker(&owned(&["ps", "-a", "--no-trunc", "--format", PS_FORMAT]))
            .await?;
        parse_ps(&stdout)
    }

    async fn wait(&self, id: &str, condition: WaitCondition) -> Result<i64, RuntimeError> {
        let args = match condition {
            WaitCondition::NotRunning => owned(&["wait", id]),
        };
        let stdout = self.docker(&args).await?;
        stdout
            .trim()
            .parse()
            .map_err(|_| RuntimeError::Parse(format!("exit code {:?}", stdout.trim())))
    }
}
