//! In-memory runtime that records every call, for deployer and manager tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSummary, RuntimeError, ServiceSpec, WaitCondition,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub image: String,
    pub running: bool,
    pub spec: ServiceSpec,
    pub spec_hash: Option<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    exit_code: Mutex<i64>,
    next_id: Mutex<u64>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an existing container.
    pub fn with_container(self, name: &str, image: &str, running: bool) -> Self {
        let id = self.allocate_id();
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                id,
                image: image.to_string(),
                running,
                spec: ServiceSpec::default(),
                spec_hash: None,
            },
        );
        self
    }

    /// Makes every call of `op` ("pull", "remove", ...) fail.
    pub fn fail_on(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub fn set_exit_code(&self, code: i64) {
        *self.exit_code.lock().unwrap() = code;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that change host state.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("inspect") && !c.starts_with("list"))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    fn allocate_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        format!("id-{}", *next)
    }

    fn record(&self, op: &str, arg: &str) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().push(format!("{} {}", op, arg));
        if self.failing.lock().unwrap().contains(op) {
            return Err(RuntimeError::Command(format!("{} {} failed", op, arg)));
        }
        Ok(())
    }

    /// Resolves a container by name or id.
    fn key_for(&self, name_or_id: &str) -> Option<String> {
        let containers = self.containers.lock().unwrap();
        if containers.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        containers
            .iter()
            .find(|(_, c)| c.id == name_or_id)
            .map(|(name, _)| name.clone())
    }

    fn missing(name: &str) -> RuntimeError {
        RuntimeError::Command(format!("No such container: {}", name))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.record("pull", image)
    }

    async fn create(&self, name: &str, spec: &ServiceSpec) -> Result<String, RuntimeError> {
        self.record("create", name)?;
        if self.key_for(name).is_some() {
            return Err(RuntimeError::Command(format!("name {} already in use", name)));
        }
        let id = self.allocate_id();
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                image: spec.image.clone(),
                running: false,
                spec: spec.clone(),
                spec_hash: Some(spec.spec_hash()),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("start", id)?;
        let key = self.key_for(id).ok_or_else(|| Self::missing(id))?;
        if let Some(c) = self.containers.lock().unwrap().get_mut(&key) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("stop", id)?;
        let key = self.key_for(id).ok_or_else(|| Self::missing(id))?;
        if let Some(c) = self.containers.lock().unwrap().get_mut(&key) {
            c.running = false;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RuntimeError> {
        self.record("rename", &format!("{} {}", from, to))?;
        let key = self.key_for(from).ok_or_else(|| Self::missing(from))?;
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(to) {
            return Err(RuntimeError::Command(format!("name {} already in use", to)));
        }
        if let Some(c) = containers.remove(&key) {
            containers.insert(to.to_string(), c);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("remove", id)?;
        let key = self.key_for(id).ok_or_else(|| Self::missing(id))?;
        self.containers.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        self.record("inspect", name)?;
        let key = self.key_for(name).ok_or_else(|| Self::missing(name))?;
        let containers = self.containers.lock().unwrap();
        let c = containers.get(&key).ok_or_else(|| Self::missing(name))?;
        Ok(ContainerInfo {
            id: c.id.clone(),
            image: c.image.clone(),
            running: c.running,
            spec_hash: c.spec_hash.clone(),
        })
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record("list", "")?;
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, c)| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", name)],
                running: c.running,
            })
            .collect())
    }

    async fn wait(&self, id: &str, _condition: WaitCondition) -> Result<i64, RuntimeError> {
        self.record("wait", id)?;
        let key = self.key_for(id).ok_or_else(|| Self::missing(id))?;
        if let Some(c) = self.containers.lock().unwrap().get_mut(&key) {
            c.running = false;
        }
        Ok(*self.exit_code.lock().unwrap())
    }
}
