use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClusterState, StateError};
use crate::cert::verification::verify_chain;
use crate::cert::{CertificateType, ChainRequest, PkiError, TrustChain, TrustChainBuilder};
use crate::config::{ClusterConfig, HostConfig};
use crate::retry::{retry_until, retry_until_deadline, RetryError, RetryPolicy, DEFAULT_RETRY_INTERVAL};
use crate::store::{secret_fields, CredentialStore};

/// Config map key holding the full serialized [`ClusterState`].
pub const FULL_STATE_KEY: &str = "full-cluster-state";
/// Config map key written by older releases, holding only the cluster config.
pub const LEGACY_STATE_KEY: &str = "cluster-state";

pub const DEFAULT_SAVE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Saves and fetches cluster state against a credential store, retrying
/// every call until it succeeds or the deadline passes.
#[derive(Debug, Clone)]
pub struct StateReconciler {
    retry_interval: Duration,
    save_timeout: Duration,
    fetch_timeout: Duration,
    cancel: CancellationToken,
}

impl Default for StateReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_SAVE_TIMEOUT, DEFAULT_FETCH_TIMEOUT)
    }
}

impl StateReconciler {
    pub fn new(save_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            save_timeout,
            fetch_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_interval, self.fetch_timeout)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Persists the current certificates as secrets and the whole state as a
    /// config blob. Input is validated before any store call.
    pub async fn save_state(
        &self,
        state: &ClusterState,
        store: &dyn CredentialStore,
    ) -> Result<(), StateError> {
        let chain = state
            .current
            .certificates
            .as_ref()
            .ok_or_else(|| StateError::InvalidInput("current state has no certificates".to_string()))?;
        if chain.is_empty() {
            return Err(StateError::InvalidInput(
                "current certificate bundle is empty".to_string(),
            ));
        }

        let mut secrets = Vec::with_capacity(chain.len());
        for record in chain.records() {
            validate_secret_name(&record.name)?;
            let fields = secret_fields(record)
                .map_err(|e| StateError::Serialization(format!("{}: {}", record.name, e)))?;
            secrets.push((record.name.as_str(), fields));
        }
        let blob =
            serde_yaml::to_string(state).map_err(|e| StateError::Serialization(e.to_string()))?;

        let deadline = Instant::now() + self.save_timeout;
        info!("[state] Saving cluster state to the cluster");

        for (name, fields) in &secrets {
            retry_until_deadline(
                self.retry_interval,
                deadline,
                &format!("save certificate {}", name),
                &self.cancel,
                move || async move { store.put_secret(name, fields).await },
            )
            .await
            .map_err(|e| self.save_error(e))?;
            debug!("[state] Saved certificate {}", name);
        }

        let blob = blob.as_bytes();
        retry_until_deadline(
            self.retry_interval,
            deadline,
            "save cluster state",
            &self.cancel,
            move || async move { store.put_config_blob(FULL_STATE_KEY, blob).await },
        )
        .await
        .map_err(|e| self.save_error(e))?;

        info!("[state] Successfully saved cluster state");
        Ok(())
    }

    fn save_error(&self, error: RetryError) -> StateError {
        StateError::from(match error {
            RetryError::Timeout {
                operation,
                last_error,
                ..
            } => RetryError::Timeout {
                operation,
                timeout: self.save_timeout,
                last_error,
            },
            other => other,
        })
    }

    /// Reads the tracked state. Any failure, including a blob that does not
    /// decode, yields `None`.
    pub async fn fetch_state(&self, store: &dyn CredentialStore) -> Option<ClusterState> {
        info!("[state] Fetching cluster state from the cluster");
        let blob = retry_until(
            &self.fetch_policy(),
            "fetch cluster state",
            &self.cancel,
            move || async move { store.get_config_blob(FULL_STATE_KEY).await },
        )
        .await;

        let blob = match blob {
            Ok(blob) => blob,
            Err(RetryError::Timeout { .. }) => {
                warn!("[state] Timed out waiting for the cluster state, treating as new cluster");
                return None;
            }
            Err(RetryError::Cancelled { .. }) => {
                warn!("[state] Fetching cluster state was cancelled");
                return None;
            }
        };

        match serde_yaml::from_slice::<ClusterState>(&blob) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("[state] Failed to decode cluster state: {}", e);
                None
            }
        }
    }
}

/// Kubernetes object names must be RFC 1123 labels.
fn validate_secret_name(name: &str) -> Result<(), StateError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidInput(format!(
            "{:?} is not a valid secret name",
            name
        )))
    }
}

/// Chooses the trust chain for this run: a fresh chain when none exists,
/// otherwise the prior chain with any requested or implied rotation applied.
pub fn reconcile_certificates(
    builder: &TrustChainBuilder<'_>,
    prior: Option<&ClusterState>,
    config: &ClusterConfig,
    request: &ChainRequest<'_>,
) -> Result<TrustChain, PkiError> {
    let existing = prior.and_then(|state| {
        state
            .desired
            .certificates
            .as_ref()
            .or(state.current.certificates.as_ref())
    });

    let existing = match existing {
        Some(chain) if !chain.is_complete() => {
            warn!("[certificates] Stored certificate bundle is incomplete, regenerating");
            return builder.generate_chain(request);
        }
        Some(chain) => {
            if let Err(e) = verify_chain(chain) {
                warn!("[certificates] Stored certificate bundle is invalid, regenerating: {}", e);
                return builder.generate_chain(request);
            }
            chain
        }
        None => return builder.generate_chain(request),
    };

    let mut targets = BTreeSet::new();
    if let Some(rotate) = &config.rotate_certificates {
        if rotate.ca {
            targets.insert(CertificateType::Authority);
        }
        for service in &rotate.services {
            match CertificateType::for_service(service) {
                Some(cert_type) => {
                    targets.insert(cert_type);
                }
                None => warn!("[certificates] No certificate to rotate for service {}", service),
            }
        }
    }

    let previous_config = prior.and_then(|s| s.current.config.as_ref());
    if let Some(previous) = previous_config {
        if control_plane_changed(previous, config) {
            info!("[certificates] Control plane hosts changed, regenerating API server certificate");
            targets.insert(CertificateType::ApiServer);
        }
        if first_control_plane(previous) != first_control_plane(config) {
            info!("[certificates] API endpoint moved, regenerating admin certificate");
            targets.insert(CertificateType::Admin);
        }
    }

    if targets.is_empty() {
        info!("[certificates] Reusing existing certificates");
        return Ok(existing.clone());
    }
    builder.rotate(existing, &targets, request)
}

/// Address the admin kubeconfig points at.
fn first_control_plane(config: &ClusterConfig) -> Option<&str> {
    config
        .control_plane_hosts()
        .first()
        .map(|host| host.address.as_str())
}

fn control_plane_changed(previous: &ClusterConfig, next: &ClusterConfig) -> bool {
    fn identity(host: &HostConfig) -> (&str, &str, &str) {
        let advertise = if host.advertise_address.is_empty() {
            host.address.as_str()
        } else {
            host.advertise_address.as_str()
        };
        let hostname = if host.hostname.is_empty() {
            host.address.as_str()
        } else {
            host.hostname.as_str()
        };
        (host.address.as_str(), advertise, hostname)
    }
    let before: Vec<_> = previous.control_plane_hosts().into_iter().map(identity).collect();
    let after: Vec<_> = next.control_plane_hosts().into_iter().map(identity).collect();
    before != after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostRole, RotateCertificates, SystemDefaults};
    use crate::state::ClusterSnapshot;
    use crate::store::{MemoryStore, MockCredentialStore, SecretFields, StoreError};
    use crate::testing::{control_plane_host, sample_chain, test_defaults};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn reconciler(timeout_secs: u64) -> StateReconciler {
        StateReconciler::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(timeout_secs),
        )
    }

    fn config_with(addresses: &[&str]) -> ClusterConfig {
        let mut config = ClusterConfig {
            nodes: addresses
                .iter()
                .map(|a| HostConfig {
                    address: a.to_string(),
                    role: vec![HostRole::Controlplane, HostRole::Etcd],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        config.apply_defaults(&SystemDefaults::default());
        config
    }

    fn sample_state() -> ClusterState {
        let chain = sample_chain(&["10.0.0.1"]);
        let snapshot = ClusterSnapshot {
            config: Some(config_with(&["10.0.0.1"])),
            certificates: Some(chain),
        };
        ClusterState {
            desired: snapshot.clone(),
            current: snapshot,
        }
    }

    /// Store whose calls fail a fixed number of times before succeeding.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyStore {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Default::default()
            }
        }

        fn trip(&self, call: String) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(call);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl CredentialStore for FlakyStore {
        async fn put_secret(&self, name: &str, fields: &SecretFields) -> Result<(), StoreError> {
            self.trip(format!("put_secret {}", name))?;
            self.inner.put_secret(name, fields).await
        }
        async fn get_secret(&self, name: &str) -> Result<SecretFields, StoreError> {
            self.trip(format!("get_secret {}", name))?;
            self.inner.get_secret(name).await
        }
        async fn put_config_blob(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
            self.trip(format!("put_config_blob {}", key))?;
            self.inner.put_config_blob(key, data).await
        }
        async fn get_config_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.trip(format!("get_config_blob {}", key))?;
            self.inner.get_config_blob(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_fetch_round_trips() {
        let store = MemoryStore::new();
        let state = sample_state();
        let reconciler = reconciler(20);

        reconciler.save_state(&state, &store).await.unwrap();
        assert_eq!(store.secret_names().len(), 7);
        assert!(store.has_blob(FULL_STATE_KEY));

        let fetched = reconciler.fetch_state(&store).await.unwrap();
        assert_eq!(fetched, state);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_from_empty_store_gives_none_after_deadline() {
        let store = MemoryStore::new();
        let start = Instant::now();

        assert!(reconciler(30).fetch_state(&store).await.is_none());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_blob_gives_none() {
        let store = MemoryStore::new();
        store
            .put_config_blob(FULL_STATE_KEY, b"desiredState: [not, a, map")
            .await
            .unwrap();

        assert!(reconciler(30).fetch_state(&store).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn save_tolerates_failures_within_budget() {
        let store = FlakyStore::failing(3);
        reconciler(20).save_state(&sample_state(), &store).await.unwrap();

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 7 + 1 + 3);
        assert_eq!(calls.last().unwrap(), "put_config_blob full-cluster-state");
    }

    #[tokio::test(start_paused = true)]
    async fn save_times_out_when_failures_fill_budget_exactly() {
        let store = FlakyStore::failing(4);
        let start = Instant::now();
        let err = reconciler(20)
            .save_state(&sample_state(), &store)
            .await
            .unwrap_err();

        assert!(matches!(err, StateError::Timeout { .. }), "{:?}", err);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(store.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn save_times_out_when_failures_exceed_budget() {
        let store = FlakyStore::failing(5);
        let err = reconciler(20)
            .save_state(&sample_state(), &store)
            .await
            .unwrap_err();

        match err {
            StateError::Timeout { timeout, .. } => assert_eq!(timeout, Duration::from_secs(20)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!store.inner.has_blob(FULL_STATE_KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_succeeds_after_transient_failures() {
        let store = FlakyStore::failing(0);
        let state = sample_state();
        reconciler(20).save_state(&state, &store).await.unwrap();

        store.failures_left.store(3, Ordering::SeqCst);
        assert_eq!(reconciler(20).fetch_state(&store).await, Some(state));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_makes_no_store_calls() {
        let mut store = MockCredentialStore::new();
        store.expect_put_secret().never();
        store.expect_put_config_blob().never();

        let mut state = sample_state();
        state.current.certificates = None;
        let err = reconciler(20).save_state(&state, &store).await.unwrap_err();
        assert!(matches!(err, StateError::InvalidInput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_save_stops_promptly() {
        let mut store = MockCredentialStore::new();
        store
            .expect_put_secret()
            .returning(|_, _| Err(StoreError::Unavailable("down".to_string())));
        let cancel = CancellationToken::new();
        let reconciler = reconciler(600).with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = reconciler.save_state(&sample_state(), &store).await.unwrap_err();
        assert!(matches!(err, StateError::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn secret_names_must_be_dns_labels() {
        assert!(validate_secret_name("kube-apiserver").is_ok());
        assert!(validate_secret_name("Kube_CA").is_err());
        assert!(validate_secret_name("-kube").is_err());
        assert!(validate_secret_name("").is_err());
    }

    fn request_for<'a>(hosts: &'a [crate::hosts::Host]) -> ChainRequest<'a> {
        ChainRequest {
            control_plane_hosts: hosts,
            cluster_domain: "cluster.local",
            service_ip: "10.233.0.1".parse().unwrap(),
            local_admin_config_path: "./kube_config_cluster.yml",
        }
    }

    #[test]
    fn prior_chain_is_reused() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.1")];
        let state = sample_state();

        let chain = reconcile_certificates(
            &builder,
            Some(&state),
            &config_with(&["10.0.0.1"]),
            &request_for(&hosts),
        )
        .unwrap();
        assert_eq!(Some(&chain), state.desired.certificates.as_ref());
    }

    #[test]
    fn no_prior_state_generates_fresh_chain() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.1")];

        let chain = reconcile_certificates(
            &builder,
            None,
            &config_with(&["10.0.0.1"]),
            &request_for(&hosts),
        )
        .unwrap();
        assert!(chain.is_complete());
    }

    #[test]
    fn control_plane_change_rotates_api_server_only() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.1"), control_plane_host("10.0.0.2")];
        let state = sample_state();
        let prior_chain = state.desired.certificates.clone().unwrap();

        let chain = reconcile_certificates(
            &builder,
            Some(&state),
            &config_with(&["10.0.0.1", "10.0.0.2"]),
            &request_for(&hosts),
        )
        .unwrap();

        for name in prior_chain.names() {
            let changed = prior_chain.get(name) != chain.get(name);
            assert_eq!(changed, name == "kube-apiserver", "{}", name);
        }
    }

    #[test]
    fn moved_api_endpoint_reissues_admin_kubeconfig() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.2")];
        let state = sample_state();
        let prior_chain = state.desired.certificates.clone().unwrap();

        let chain = reconcile_certificates(
            &builder,
            Some(&state),
            &config_with(&["10.0.0.2"]),
            &request_for(&hosts),
        )
        .unwrap();

        let admin = chain.get_type(CertificateType::Admin).unwrap();
        let kubeconfig = admin.config.as_deref().unwrap();
        assert!(kubeconfig.contains("https://10.0.0.2:6443"), "{}", kubeconfig);
        assert!(!kubeconfig.contains("10.0.0.1"));
        assert_eq!(prior_chain.get("kube-ca"), chain.get("kube-ca"));
        assert_eq!(prior_chain.get("kube-node"), chain.get("kube-node"));
    }

    #[test]
    fn chain_with_foreign_leaf_is_regenerated() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.1")];
        let mut state = sample_state();

        let mut records = state.desired.certificates.clone().unwrap().into_records();
        let foreign = sample_chain(&["10.0.0.1"]);
        let node = foreign.get_type(CertificateType::Node).unwrap().clone();
        records.insert(node.name.clone(), node);
        let tampered = TrustChain::from_records(records);
        state.desired.certificates = Some(tampered.clone());

        let chain = reconcile_certificates(
            &builder,
            Some(&state),
            &config_with(&["10.0.0.1"]),
            &request_for(&hosts),
        )
        .unwrap();

        assert_ne!(chain.get("kube-ca"), tampered.get("kube-ca"));
        verify_chain(&chain).unwrap();
    }

    #[test]
    fn requested_rotation_regenerates_named_certificates() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.1")];
        let state = sample_state();
        let prior_chain = state.desired.certificates.clone().unwrap();

        let mut config = config_with(&["10.0.0.1"]);
        config.rotate_certificates = Some(RotateCertificates {
            services: vec!["kubelet".to_string(), "etcd".to_string()],
            ca: false,
        });
        let chain =
            reconcile_certificates(&builder, Some(&state), &config, &request_for(&hosts)).unwrap();

        assert_ne!(prior_chain.get("kube-node"), chain.get("kube-node"));
        assert_eq!(prior_chain.get("kube-ca"), chain.get("kube-ca"));
        assert_eq!(prior_chain.get("kube-proxy"), chain.get("kube-proxy"));
    }

    #[test]
    fn legacy_seeded_desired_chain_is_preferred() {
        let defaults = test_defaults();
        let builder = TrustChainBuilder::new(&defaults);
        let hosts = vec![control_plane_host("10.0.0.1")];
        let legacy_chain = sample_chain(&["10.0.0.1"]);
        let state = ClusterState {
            desired: ClusterSnapshot {
                config: None,
                certificates: Some(legacy_chain.clone()),
            },
            current: ClusterSnapshot::default(),
        };

        let chain = reconcile_certificates(
            &builder,
            Some(&state),
            &config_with(&["10.0.0.1"]),
            &request_for(&hosts),
        )
        .unwrap();
        assert_eq!(chain, legacy_chain);
    }
}
