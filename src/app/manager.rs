// src/app/manager.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cert::{CertificateType, ChainRequest, PkiError, TrustChain, TrustChainBuilder};
use crate::config::{ClusterConfig, HostConfig, HostRole, SystemDefaults};
use crate::deploy::services::{
    ServiceBuilder, CERTIFICATES_ROLE, CONTROL_ROLE, ETCD_ROLE, KUBELET_CONTAINER_NAME,
    KUBEPROXY_CONTAINER_NAME, NETWORK_ROLE, WORKER_ROLE,
};
use crate::deploy::{ContainerRuntime, PlaneReport, RollingDeployer, ServiceSpec};
use crate::error::{Error, Result};
use crate::hosts::{hosts_with_role, Host};
use crate::kubeconfig::write_kubeconfig;
use crate::state::file::{read_state_file, state_file_path, write_state_file};
use crate::state::legacy::upgrade_legacy_cluster;
use crate::state::{
    reconcile_certificates, ClusterSnapshot, ClusterState, StateReconciler,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_SAVE_TIMEOUT,
};
use crate::store::CredentialStore;

/// Opens the container runtime of one node.
pub type RuntimeFactory = Arc<dyn Fn(&HostConfig) -> Arc<dyn ContainerRuntime> + Send + Sync>;
/// Opens the credential store behind an admin kubeconfig.
pub type StoreFactory = Arc<dyn Fn(&Path) -> Arc<dyn CredentialStore> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub config_path: PathBuf,
    pub kubeconfig_path: PathBuf,
    pub save_timeout: Duration,
    pub fetch_timeout: Duration,
    pub dry_run: bool,
}

impl ManagerOptions {
    /// `cluster.yml` puts the admin kubeconfig at `kube_config_cluster.yml`
    /// next to it.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let kubeconfig_path = default_kubeconfig_path(&config_path);
        Self {
            config_path,
            kubeconfig_path,
            save_timeout: DEFAULT_SAVE_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            dry_run: false,
        }
    }
}

pub fn default_kubeconfig_path(config_path: &Path) -> PathBuf {
    let file_name = config_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cluster.yml".to_string());
    config_path.with_file_name(format!("kube_config_{}", file_name))
}

/// Runs a full cluster bring-up: state, certificates, then every plane.
pub struct ClusterManager {
    options: ManagerOptions,
    defaults: SystemDefaults,
    reconciler: StateReconciler,
    deployer: RollingDeployer,
    runtime_for: RuntimeFactory,
    store_for: StoreFactory,
}

impl ClusterManager {
    pub fn new(
        options: ManagerOptions,
        defaults: SystemDefaults,
        runtime_for: RuntimeFactory,
        store_for: StoreFactory,
    ) -> Self {
        let reconciler = StateReconciler::new(options.save_timeout, options.fetch_timeout);
        Self {
            options,
            defaults,
            reconciler,
            deployer: RollingDeployer::new(),
            runtime_for,
            store_for,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.reconciler = self.reconciler.with_cancellation(cancel.clone());
        self.deployer = self.deployer.with_cancellation(cancel);
        self
    }

    pub fn state_file(&self) -> PathBuf {
        state_file_path(&self.options.config_path)
    }

    pub fn kubeconfig_path(&self) -> &Path {
        &self.options.kubeconfig_path
    }

    /// Brings the cluster to `config` and returns the resulting state.
    ///
    /// The local state file records the desired state before any host is
    /// touched; current state only moves once every plane deployed and the
    /// cluster accepted the new state.
    pub async fn up(&self, mut config: ClusterConfig) -> Result<ClusterState> {
        config.apply_defaults(&self.defaults);
        config.validate()?;

        let hosts: Vec<Host> = config
            .nodes
            .iter()
            .map(|node| Host::from_config(node, (self.runtime_for)(node)))
            .collect();
        let store = (self.store_for)(&self.options.kubeconfig_path);

        let prior = self.load_prior_state(store.as_ref()).await?;

        let control_plane = hosts_with_role(&hosts, HostRole::Controlplane);
        let admin_path = self.options.kubeconfig_path.to_string_lossy().into_owned();
        let request = ChainRequest {
            control_plane_hosts: &control_plane,
            cluster_domain: &config.cluster_domain,
            service_ip: config.service_ip()?,
            local_admin_config_path: &admin_path,
        };
        let builder = TrustChainBuilder::new(&self.defaults);
        let chain = reconcile_certificates(&builder, prior.as_ref(), &config, &request)?;

        let mut desired_config = config.clone();
        desired_config.rotate_certificates = None;
        let mut state = ClusterState {
            desired: ClusterSnapshot {
                config: Some(desired_config),
                certificates: Some(chain.clone()),
            },
            current: prior.map(|p| p.current).unwrap_or_default(),
        };

        if self.options.dry_run {
            info!("Dry run: skipping deployment, nothing is written");
            state.current = state.desired.clone();
            self.reconciler.save_state(&state, store.as_ref()).await?;
            return Ok(state);
        }

        write_state_file(&self.state_file(), &state)?;
        self.write_admin_kubeconfig(&chain)?;

        self.remove_dropped_workers(state.current.config.as_ref(), &config)
            .await;
        self.deploy(&config, &hosts, &chain).await?;

        state.current = state.desired.clone();
        self.reconciler.save_state(&state, store.as_ref()).await?;
        write_state_file(&self.state_file(), &state)?;
        info!("Finished building the cluster");
        Ok(state)
    }

    /// Clears kubelet and kube-proxy from hosts that ran them last time but
    /// no longer do. Unreachable hosts are logged and skipped.
    async fn remove_dropped_workers(&self, previous: Option<&ClusterConfig>, config: &ClusterConfig) {
        fn runs_kubelet(node: &HostConfig) -> bool {
            node.has_role(HostRole::Controlplane) || node.has_role(HostRole::Worker)
        }
        let Some(previous) = previous else {
            return;
        };
        let dropped: Vec<Host> = previous
            .nodes
            .iter()
            .filter(|node| runs_kubelet(node))
            .filter(|node| {
                !config
                    .nodes
                    .iter()
                    .any(|n| n.address == node.address && runs_kubelet(n))
            })
            .map(|node| Host::from_config(node, (self.runtime_for)(node)))
            .collect();
        if dropped.is_empty() {
            return;
        }

        let report = self
            .deployer
            .remove_plane(
                WORKER_ROLE,
                &dropped,
                &[KUBELET_CONTAINER_NAME, KUBEPROXY_CONTAINER_NAME],
            )
            .await;
        for failure in &report.failures {
            warn!("[{}] Host left in place: {}", WORKER_ROLE, failure);
        }
    }

    async fn load_prior_state(&self, store: &dyn CredentialStore) -> Result<Option<ClusterState>> {
        let state_file = self.state_file();
        if !self.options.dry_run {
            if let Some(state) = read_state_file(&state_file)? {
                return Ok(Some(state));
            }
        }
        if self.options.dry_run || !self.options.kubeconfig_path.exists() {
            return Ok(None);
        }

        if let Some(state) = self.reconciler.fetch_state(store).await {
            return Ok(Some(state));
        }
        Ok(upgrade_legacy_cluster(&self.options.kubeconfig_path, None, store, &self.reconciler).await)
    }

    fn write_admin_kubeconfig(&self, chain: &TrustChain) -> Result<()> {
        let admin = chain
            .get_type(CertificateType::Admin)
            .ok_or_else(|| PkiError::MissingCertificate(CertificateType::Admin.name().to_string()))?;
        match &admin.config {
            Some(config) => {
                write_kubeconfig(&self.options.kubeconfig_path, config)?;
                info!(
                    "Wrote admin kubeconfig to {}",
                    self.options.kubeconfig_path.display()
                );
            }
            None => warn!("Admin certificate carries no kubeconfig, not writing one"),
        }
        Ok(())
    }

    async fn deploy(&self, config: &ClusterConfig, hosts: &[Host], chain: &TrustChain) -> Result<()> {
        let etcd_hosts = hosts_with_role(hosts, HostRole::Etcd);
        let control_plane = hosts_with_role(hosts, HostRole::Controlplane);
        let kubelet_hosts: Vec<Host> = hosts
            .iter()
            .filter(|h| h.has_role(HostRole::Controlplane) || h.has_role(HostRole::Worker))
            .cloned()
            .collect();
        let services =
            ServiceBuilder::new(config, &self.defaults, &etcd_hosts).with_certificates(chain)?;

        let mut cert_jobs: HashMap<String, ServiceSpec> = HashMap::new();
        for host in hosts {
            cert_jobs.insert(host.address.clone(), services.cert_deployer(chain, host)?);
        }
        let report = self
            .deployer
            .run_plane_jobs(CERTIFICATES_ROLE, hosts, |host| {
                cert_jobs.get(&host.address).cloned()
            })
            .await;
        check(report)?;

        let report = self
            .deployer
            .deploy_plane(ETCD_ROLE, &etcd_hosts, |host| vec![services.etcd(host)])
            .await;
        check(report)?;

        let report = self
            .deployer
            .deploy_plane(CONTROL_ROLE, &control_plane, |host| {
                services.control_plane_services(host)
            })
            .await;
        check(report)?;

        let report = self
            .deployer
            .deploy_plane(WORKER_ROLE, &kubelet_hosts, |host| services.worker_services(host))
            .await;
        check(report)?;

        match services.network_plugin_job(chain)? {
            Some(job) => {
                let report = self
                    .deployer
                    .run_plane_jobs(NETWORK_ROLE, &control_plane[..1], |_| Some(job.clone()))
                    .await;
                check(report)?;
            }
            None => info!(
                "[{}] No manifest for network plugin {}, skipping",
                NETWORK_ROLE, config.network.plugin
            ),
        }
        Ok(())
    }
}

fn check(report: PlaneReport) -> Result<()> {
    if report.is_success() {
        info!(
            "[{}] Successfully deployed {} unit(s)",
            report.plane,
            report.outcomes.len()
        );
        return Ok(());
    }
    Err(Error::Deploy {
        plane: report.plane,
        failures: report.failures,
    })
}
