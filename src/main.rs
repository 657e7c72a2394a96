// src/main.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kube_bootstrap::app::{ClusterManager, ManagerOptions, RuntimeFactory, StoreFactory};
use kube_bootstrap::cert::inspect::analyze_chain;
use kube_bootstrap::config::{ClusterConfig, HostConfig, RotateCertificates, SystemDefaults};
use kube_bootstrap::deploy::docker::DockerCli;
use kube_bootstrap::deploy::ContainerRuntime;
use kube_bootstrap::state::ClusterState;
use kube_bootstrap::store::{CredentialStore, KubectlStore, MemoryStore};
use kube_bootstrap::utils::logging::init_logging;

#[derive(Parser)]
#[command(name = "kube-bootstrap", about = "Bring up a Kubernetes cluster from a cluster file")]
pub struct Args {
    #[arg(short, long, default_value = "cluster.yml")]
    pub config: String,
    #[arg(short, long)]
    pub debug: bool,
    #[arg(long)]
    pub log_file: Option<String>,
    /// Generate certificates and state without touching any host.
    #[arg(long)]
    pub dry_run: bool,
    /// Seconds to keep retrying the state save.
    #[arg(long, default_value_t = 120)]
    pub save_timeout: u64,
    /// Seconds to keep retrying the state fetch.
    #[arg(long, default_value_t = 30)]
    pub fetch_timeout: u64,
    /// Services whose certificates are reissued, e.g. `kubelet,kube-api`.
    #[arg(long, value_delimiter = ',')]
    pub rotate_certs: Vec<String>,
    /// Reissue the cluster authority and every certificate it signed.
    #[arg(long)]
    pub rotate_ca: bool,
    /// Admin kubeconfig path; defaults to `kube_config_<cluster file>`.
    #[arg(long)]
    pub kubeconfig: Option<String>,
}

fn expand(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path).with_context(|| format!("cannot expand {}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

fn print_summary(state: &ClusterState) -> Result<()> {
    let Some(chain) = state.desired.certificates.as_ref() else {
        return Ok(());
    };
    println!("{:<26} {:<28} {}", "CERTIFICATE", "EXPIRES", "SUBJECT");
    for info in analyze_chain(chain)? {
        println!(
            "{:<26} {:<28} {}",
            info.name,
            info.not_after.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            info.subject
        );
        if info.expires_within(chrono::Duration::days(30)) {
            warn!("Certificate {} expires on {}", info.name, info.not_after);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args.log_file.as_deref().map(expand).transpose()?;
    init_logging(log_file.as_deref(), args.debug)?;

    let config_path = expand(&args.config)?;
    let mut config = ClusterConfig::load_from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if args.rotate_ca || !args.rotate_certs.is_empty() {
        let rotate = config
            .rotate_certificates
            .get_or_insert_with(RotateCertificates::default);
        rotate.ca |= args.rotate_ca;
        rotate.services.extend(args.rotate_certs.iter().cloned());
    }

    let mut options = ManagerOptions::new(&config_path);
    if let Some(kubeconfig) = &args.kubeconfig {
        options.kubeconfig_path = expand(kubeconfig)?;
    }
    options.save_timeout = Duration::from_secs(args.save_timeout);
    options.fetch_timeout = Duration::from_secs(args.fetch_timeout);
    options.dry_run = args.dry_run;

    let runtime_for: RuntimeFactory = Arc::new(|node: &HostConfig| {
        Arc::new(DockerCli::for_host(node)) as Arc<dyn ContainerRuntime>
    });
    let store_for: StoreFactory = if args.dry_run {
        let memory = Arc::new(MemoryStore::new());
        Arc::new(move |_: &Path| memory.clone() as Arc<dyn CredentialStore>)
    } else {
        Arc::new(|kubeconfig: &Path| {
            Arc::new(KubectlStore::new(kubeconfig)) as Arc<dyn CredentialStore>
        })
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let manager = ClusterManager::new(options, SystemDefaults::default(), runtime_for, store_for)
        .with_cancellation(cancel);
    info!("Building cluster from {}", config_path.display());
    let state = manager.up(config).await?;

    print_summary(&state)?;
    if !args.dry_run {
        println!("Admin kubeconfig: {}", manager.kubeconfig_path().display());
    }
    Ok(())
}
