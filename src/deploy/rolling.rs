use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, DeployError, DeployStep, PlaneReport, RuntimeError, ServiceSpec,
    UnitOutcome, WaitCondition,
};
use crate::hosts::Host;

/// Name prefix of the container kept aside during a rolling update.
pub const OLD_CONTAINER_PREFIX: &str = "old-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Unchanged,
    /// `leftover` names the renamed container when it could not be removed.
    Updated { leftover: Option<String> },
    Removed,
}

/// Brings service containers on a host to their desired spec, replacing a
/// running container only after the new one can be created.
#[derive(Debug, Clone, Default)]
pub struct RollingDeployer {
    cancel: CancellationToken,
}

fn step_error<'a>(
    host: &'a Host,
    container: &'a str,
    step: DeployStep,
) -> impl FnOnce(RuntimeError) -> DeployError + 'a {
    move |source| DeployError {
        host: host.address.clone(),
        container: container.to_string(),
        step,
        source,
    }
}

impl RollingDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn reconcile(
        &self,
        host: &Host,
        spec: &ServiceSpec,
    ) -> Result<ReconcileOutcome, DeployError> {
        let runtime = host.runtime.as_ref();
        let old_name = format!("{}{}", OLD_CONTAINER_PREFIX, spec.name);

        let containers = runtime
            .list()
            .await
            .map_err(step_error(host, &spec.name, DeployStep::List))?;
        let present = containers.iter().any(|c| c.has_name(&spec.name));
        let stale_old = containers.iter().any(|c| c.has_name(&old_name));

        if !present {
            info!("[{}] Creating container on host [{}]", spec.name, host.address);
            self.create_and_start(runtime, host, spec).await?;
            if stale_old {
                self.remove_leftover(runtime, host, &old_name).await;
            }
            return Ok(ReconcileOutcome::Created);
        }

        let info = runtime
            .inspect(&spec.name)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Inspect))?;

        // Containers created without the hash label only roll on an image change.
        let spec_matches = info
            .spec_hash
            .as_deref()
            .map_or(true, |hash| hash == spec.spec_hash());
        let up_to_date = info.image == spec.image && spec_matches;
        if info.running && (!spec.upgrade_aware || up_to_date) {
            debug!(
                "[{}] Container is already running on host [{}]",
                spec.name, host.address
            );
            return Ok(ReconcileOutcome::Unchanged);
        }

        info!(
            "[{}] Updating container on host [{}]: image {} -> {}, spec changed: {}",
            spec.name, host.address, info.image, spec.image, !spec_matches
        );
        self.rolling_update(runtime, host, spec, &old_name, stale_old)
            .await
    }

    async fn rolling_update(
        &self,
        runtime: &dyn ContainerRuntime,
        host: &Host,
        spec: &ServiceSpec,
        old_name: &str,
        stale_old: bool,
    ) -> Result<ReconcileOutcome, DeployError> {
        if stale_old {
            runtime
                .remove(old_name)
                .await
                .map_err(step_error(host, old_name, DeployStep::Remove))?;
        }

        // Pull while the old container still serves.
        runtime
            .pull(&spec.image)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Pull))?;

        runtime
            .rename(&spec.name, old_name)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Rename))?;
        runtime
            .stop(old_name)
            .await
            .map_err(step_error(host, old_name, DeployStep::Stop))?;
        runtime
            .wait(old_name, WaitCondition::NotRunning)
            .await
            .map_err(step_error(host, old_name, DeployStep::Wait))?;

        let id = runtime
            .create(&spec.name, spec)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Create))?;
        runtime
            .start(&id)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Start))?;

        let leftover = match runtime.remove(old_name).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "[{}] Failed to remove old container [{}] on host [{}]: {}",
                    spec.name, old_name, host.address, e
                );
                Some(old_name.to_string())
            }
        };
        info!("[{}] Container updated on host [{}]", spec.name, host.address);
        Ok(ReconcileOutcome::Updated { leftover })
    }

    async fn create_and_start(
        &self,
        runtime: &dyn ContainerRuntime,
        host: &Host,
        spec: &ServiceSpec,
    ) -> Result<String, DeployError> {
        runtime
            .pull(&spec.image)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Pull))?;
        let id = runtime
            .create(&spec.name, spec)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Create))?;
        runtime
            .start(&id)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Start))?;
        Ok(id)
    }

    async fn remove_leftover(&self, runtime: &dyn ContainerRuntime, host: &Host, name: &str) {
        if let Err(e) = runtime.remove(name).await {
            warn!(
                "Failed to remove leftover container [{}] on host [{}]: {}",
                name, host.address, e
            );
        }
    }

    /// Runs `spec` to completion and removes it. A non-zero exit is an error.
    pub async fn run_once(&self, host: &Host, spec: &ServiceSpec) -> Result<(), DeployError> {
        let runtime = host.runtime.as_ref();

        let containers = runtime
            .list()
            .await
            .map_err(step_error(host, &spec.name, DeployStep::List))?;
        if containers.iter().any(|c| c.has_name(&spec.name)) {
            debug!(
                "[{}] Removing previous job container on host [{}]",
                spec.name, host.address
            );
            runtime
                .remove(&spec.name)
                .await
                .map_err(step_error(host, &spec.name, DeployStep::Remove))?;
        }

        let id = self.create_and_start(runtime, host, spec).await?;
        let status = runtime
            .wait(&id, WaitCondition::NotRunning)
            .await
            .map_err(step_error(host, &spec.name, DeployStep::Wait))?;

        if let Err(e) = runtime.remove(&id).await {
            warn!(
                "[{}] Failed to remove job container on host [{}]: {}",
                spec.name, host.address, e
            );
        }

        if status != 0 {
            return Err(step_error(host, &spec.name, DeployStep::Exit)(
                RuntimeError::NonZeroExit(status),
            ));
        }
        info!("[{}] Job completed on host [{}]", spec.name, host.address);
        Ok(())
    }

    /// Reconciles every (host, service) unit of a plane concurrently and
    /// collects all outcomes. Units not yet started when the deployer is
    /// cancelled are reported as failures.
    pub async fn deploy_plane<F>(&self, plane: &str, hosts: &[Host], services_for: F) -> PlaneReport
    where
        F: Fn(&Host) -> Vec<ServiceSpec>,
    {
        let units: Vec<(&Host, ServiceSpec)> = hosts
            .iter()
            .flat_map(|host| services_for(host).into_iter().map(move |spec| (host, spec)))
            .collect();

        info!("[{}] Deploying {} unit(s) on {} host(s)", plane, units.len(), hosts.len());

        let results = join_all(units.into_iter().map(|(host, spec)| async move {
            if self.cancel.is_cancelled() {
                return Err(step_error(host, &spec.name, DeployStep::Schedule)(
                    RuntimeError::Cancelled,
                ));
            }
            self.reconcile(host, &spec).await.map(|outcome| UnitOutcome {
                host: host.address.clone(),
                container: spec.name.clone(),
                outcome,
            })
        }))
        .await;

        collect_report(plane, results)
    }

    /// Removes the named containers, and any renamed leftovers, from every
    /// host. Absent containers are skipped.
    pub async fn remove_plane(&self, plane: &str, hosts: &[Host], names: &[&str]) -> PlaneReport {
        let units: Vec<(&Host, &str)> = hosts
            .iter()
            .flat_map(|host| names.iter().map(move |name| (host, *name)))
            .collect();

        info!("[{}] Removing services from {} host(s)", plane, hosts.len());

        let results = join_all(units.into_iter().map(|(host, name)| async move {
            let runtime = host.runtime.as_ref();
            let old_name = format!("{}{}", OLD_CONTAINER_PREFIX, name);
            let containers = runtime
                .list()
                .await
                .map_err(step_error(host, name, DeployStep::List))?;
            for target in [name, old_name.as_str()] {
                if containers.iter().any(|c| c.has_name(target)) {
                    runtime
                        .remove(target)
                        .await
                        .map_err(step_error(host, target, DeployStep::Remove))?;
                    info!("[{}] Removed container on host [{}]", target, host.address);
                }
            }
            Ok::<_, DeployError>(UnitOutcome {
                host: host.address.clone(),
                container: name.to_string(),
                outcome: ReconcileOutcome::Removed,
            })
        }))
        .await;

        collect_report(plane, results)
    }

    /// Runs one job per host concurrently; same reporting as [`Self::deploy_plane`].
    pub async fn run_plane_jobs<F>(&self, plane: &str, hosts: &[Host], job_for: F) -> PlaneReport
    where
        F: Fn(&Host) -> Option<ServiceSpec>,
    {
        let jobs: Vec<(&Host, ServiceSpec)> = hosts
            .iter()
            .filter_map(|host| job_for(host).map(|spec| (host, spec)))
            .collect();

        let results = join_all(jobs.into_iter().map(|(host, spec)| async move {
            if self.cancel.is_cancelled() {
                return Err(step_error(host, &spec.name, DeployStep::Schedule)(
                    RuntimeError::Cancelled,
                ));
            }
            self.run_once(host, &spec).await.map(|()| UnitOutcome {
                host: host.address.clone(),
                container: spec.name.clone(),
                outcome: ReconcileOutcome::Created,
            })
        }))
        .await;

        collect_report(plane, results)
    }
}

fn collect_report(plane: &str, results: Vec<Result<UnitOutcome, DeployError>>) -> PlaneReport {
    let mut report = PlaneReport {
        plane: plane.to_string(),
        ..Default::default()
    };
    for result in results {
        match result {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(e) => {
                warn!("[{}] {}", plane, e);
                report.failures.push(e);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostRole;
    use crate::deploy::fake::FakeRuntime;
    use crate::deploy::MockContainerRuntime;
    use std::sync::Arc;

    const OLD_IMAGE: &str = "rancher/k8s:v1.8.2";
    const NEW_IMAGE: &str = "rancher/k8s:v1.8.3";

    fn spec(name: &str, image: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: image.to_string(),
            entrypoint: vec!["kube-apiserver".to_string()],
            upgrade_aware: true,
            ..Default::default()
        }
    }

    fn host_with(runtime: Arc<FakeRuntime>) -> Host {
        Host::new("10.0.0.1", vec![HostRole::Controlplane], runtime)
    }

    #[tokio::test]
    async fn absent_container_is_created_and_started() {
        let runtime = Arc::new(FakeRuntime::new());
        let host = host_with(runtime.clone());

        let outcome = RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(
            runtime.mutating_calls(),
            vec!["pull rancher/k8s:v1.8.3", "create kube-api", "start id-1"]
        );
        assert!(runtime.container("kube-api").unwrap().running);
    }

    #[tokio::test]
    async fn second_reconcile_makes_no_mutating_calls() {
        let runtime = Arc::new(FakeRuntime::new());
        let host = host_with(runtime.clone());
        let deployer = RollingDeployer::new();
        let desired = spec("kube-api", NEW_IMAGE);

        deployer.reconcile(&host, &desired).await.unwrap();
        runtime.clear_calls();

        let outcome = deployer.reconcile(&host, &desired).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(runtime.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn image_change_rolls_in_order() {
        let runtime = Arc::new(FakeRuntime::new().with_container("kube-api", OLD_IMAGE, true));
        let host = host_with(runtime.clone());

        let outcome = RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { leftover: None });
        assert_eq!(
            runtime.mutating_calls(),
            vec![
                "pull rancher/k8s:v1.8.3",
                "rename kube-api old-kube-api",
                "stop old-kube-api",
                "wait old-kube-api",
                "create kube-api",
                "start id-2",
                "remove old-kube-api",
            ]
        );
        assert_eq!(runtime.container_names(), vec!["kube-api"]);
        assert_eq!(runtime.container("kube-api").unwrap().image, NEW_IMAGE);
    }

    #[tokio::test]
    async fn stopped_container_is_replaced() {
        let runtime = Arc::new(FakeRuntime::new().with_container("kube-api", NEW_IMAGE, false));
        let host = host_with(runtime.clone());

        let outcome = RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { leftover: None });
        assert!(runtime.container("kube-api").unwrap().running);
    }

    #[tokio::test]
    async fn rotated_certificate_rolls_container_with_same_image() {
        let runtime = Arc::new(FakeRuntime::new());
        let host = host_with(runtime.clone());
        let deployer = RollingDeployer::new();
        let mut desired = spec("kube-api", NEW_IMAGE);
        desired
            .labels
            .insert("io.kube-bootstrap.certificates".to_string(), "before".to_string());
        deployer.reconcile(&host, &desired).await.unwrap();
        runtime.clear_calls();

        desired
            .labels
            .insert("io.kube-bootstrap.certificates".to_string(), "after".to_string());
        let outcome = deployer.reconcile(&host, &desired).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { leftover: None });
        assert!(runtime.mutating_calls().contains(&"create kube-api".to_string()));
        let container = runtime.container("kube-api").unwrap();
        assert_eq!(container.spec_hash, Some(desired.spec_hash()));
        assert!(container.running);
    }

    #[tokio::test]
    async fn unlabeled_container_with_current_image_is_kept() {
        let runtime = Arc::new(FakeRuntime::new().with_container("kube-api", NEW_IMAGE, true));
        let host = host_with(runtime.clone());

        let outcome = RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(runtime.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn non_upgrade_aware_service_keeps_running_image() {
        let runtime = Arc::new(FakeRuntime::new().with_container("etcd", OLD_IMAGE, true));
        let host = host_with(runtime.clone());
        let mut desired = spec("etcd", NEW_IMAGE);
        desired.upgrade_aware = false;

        let outcome = RollingDeployer::new().reconcile(&host, &desired).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(runtime.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn failed_old_removal_is_reported_as_leftover() {
        let runtime = Arc::new(FakeRuntime::new().with_container("kube-api", OLD_IMAGE, true));
        runtime.fail_on("remove");
        let host = host_with(runtime.clone());

        let outcome = RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                leftover: Some("old-kube-api".to_string())
            }
        );
        assert!(runtime.container("kube-api").unwrap().running);
        assert!(runtime.container("old-kube-api").is_some());
    }

    #[tokio::test]
    async fn stale_old_container_is_cleared_before_rename() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_container("kube-api", OLD_IMAGE, true)
                .with_container("old-kube-api", "rancher/k8s:v1.8.1", false),
        );
        let host = host_with(runtime.clone());

        RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap();

        let calls = runtime.mutating_calls();
        assert_eq!(calls[0], "remove old-kube-api");
        assert_eq!(calls[2], "rename kube-api old-kube-api");
        assert_eq!(runtime.container_names(), vec!["kube-api"]);
    }

    #[tokio::test]
    async fn create_failure_leaves_renamed_container_for_recovery() {
        let runtime = Arc::new(FakeRuntime::new().with_container("kube-api", OLD_IMAGE, true));
        runtime.fail_on("create");
        let host = host_with(runtime.clone());

        let err = RollingDeployer::new()
            .reconcile(&host, &spec("kube-api", NEW_IMAGE))
            .await
            .unwrap_err();

        assert_eq!(err.step, DeployStep::Create);
        assert_eq!(err.host, "10.0.0.1");
        assert_eq!(err.container, "kube-api");
        assert!(runtime.container("old-kube-api").is_some());
    }

    #[tokio::test]
    async fn pull_failure_is_surfaced_with_step() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list().returning(|| Ok(Vec::new()));
        runtime
            .expect_pull()
            .returning(|_| Err(RuntimeError::Command("manifest unknown".to_string())));
        runtime.expect_create().never();
        runtime.expect_start().never();
        let host = Host::new("10.0.0.9", vec![HostRole::Worker], Arc::new(runtime));

        let err = RollingDeployer::new()
            .reconcile(&host, &spec("kubelet", NEW_IMAGE))
            .await
            .unwrap_err();

        assert_eq!(err.step, DeployStep::Pull);
        assert!(err.to_string().contains("10.0.0.9"));
    }

    #[tokio::test]
    async fn run_once_removes_job_and_checks_exit_status() {
        let runtime = Arc::new(FakeRuntime::new());
        let host = host_with(runtime.clone());
        let job = spec("cert-deployer", "rancher/rke-cert-deployer:0.1.0");

        RollingDeployer::new().run_once(&host, &job).await.unwrap();
        assert!(runtime.container_names().is_empty());

        runtime.set_exit_code(3);
        let err = RollingDeployer::new().run_once(&host, &job).await.unwrap_err();
        assert_eq!(err.step, DeployStep::Exit);
        assert!(matches!(err.source, RuntimeError::NonZeroExit(3)));
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn remove_plane_clears_services_and_leftovers() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_container("kubelet", NEW_IMAGE, true)
                .with_container("old-kubelet", OLD_IMAGE, false)
                .with_container("etcd", NEW_IMAGE, true),
        );
        let host = host_with(runtime.clone());

        let report = RollingDeployer::new()
            .remove_plane("worker", &[host], &["kubelet", "kube-proxy"])
            .await;

        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(runtime.container_names(), vec!["etcd"]);
        let mut removed = runtime.mutating_calls();
        removed.sort();
        assert_eq!(removed, vec!["remove kubelet", "remove old-kubelet"]);
    }

    #[tokio::test]
    async fn deploy_plane_collects_every_unit() {
        let first = Arc::new(FakeRuntime::new());
        let second = Arc::new(FakeRuntime::new());
        second.fail_on("pull");
        let hosts = vec![
            Host::new("10.0.0.1", vec![HostRole::Worker], first.clone()),
            Host::new("10.0.0.2", vec![HostRole::Worker], second.clone()),
        ];

        let report = RollingDeployer::new()
            .deploy_plane("worker", &hosts, |_| {
                vec![spec("kubelet", NEW_IMAGE), spec("kube-proxy", NEW_IMAGE)]
            })
            .await;

        assert!(!report.is_success());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.host == "10.0.0.2"));
        assert_eq!(first.container_names(), vec!["kube-proxy", "kubelet"]);
    }

    #[tokio::test]
    async fn cancelled_deployer_starts_no_units() {
        let runtime = Arc::new(FakeRuntime::new());
        let hosts = vec![host_with(runtime.clone())];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = RollingDeployer::new()
            .with_cancellation(cancel)
            .deploy_plane("controlplane", &hosts, |_| vec![spec("kube-api", NEW_IMAGE)])
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, DeployStep::Schedule);
        assert!(runtime.calls().is_empty());
    }
}
