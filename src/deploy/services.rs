//! Container definitions for each cluster service.

use std::collections::BTreeMap;

use openssl::hash::MessageDigest;

use crate::cert::{
    cert_file_path, config_file_path, key_file_path, CertificateRecord, CertificateType, PkiError,
    TrustChain,
};
use crate::config::{ClusterConfig, HostRole, ServiceConfig, SystemDefaults};
use crate::hosts::Host;

use super::ServiceSpec;

pub const ETCD_CONTAINER_NAME: &str = "etcd";
pub const KUBE_API_CONTAINER_NAME: &str = "kube-api";
pub const KUBE_CONTROLLER_CONTAINER_NAME: &str = "kube-controller";
pub const SCHEDULER_CONTAINER_NAME: &str = "scheduler";
pub const KUBELET_CONTAINER_NAME: &str = "kubelet";
pub const KUBEPROXY_CONTAINER_NAME: &str = "kube-proxy";
pub const CERT_DEPLOYER_CONTAINER_NAME: &str = "cert-deployer";
pub const NETWORK_JOB_CONTAINER_NAME: &str = "rke-network-plugin-deploy-job";

pub const ETCD_ROLE: &str = "etcd";
pub const CONTROL_ROLE: &str = "controlplane";
pub const WORKER_ROLE: &str = "worker";
pub const CERTIFICATES_ROLE: &str = "certificates";
pub const NETWORK_ROLE: &str = "network";

const KUBERNETES_BIND: &str = "/etc/kubernetes:/etc/kubernetes";

pub const CLUSTER_CIDR_ENV: &str = "RKE_CLUSTER_CIDR";
pub const CLUSTER_DNS_SERVER_ENV: &str = "RKE_CLUSTER_DNS_SERVER";
pub const CLUSTER_DOMAIN_ENV: &str = "RKE_CLUSTER_DOMAIN";
pub const ADDON_MANIFEST_ENV: &str = "RKE_ADDON_MANIFEST";

/// Fingerprints of the certificates a service reads from disk.
pub const CERTIFICATES_LABEL: &str = "io.kube-bootstrap.certificates";

fn ssl(cert_type: CertificateType) -> String {
    cert_file_path(cert_type.name())
}

fn ssl_key(cert_type: CertificateType) -> String {
    key_file_path(cert_type.name())
}

fn kubecfg(cert_type: CertificateType) -> String {
    config_file_path(cert_type.name())
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Builds service specs from a cluster config with defaults applied.
pub struct ServiceBuilder<'a> {
    config: &'a ClusterConfig,
    defaults: &'a SystemDefaults,
    etcd_hosts: &'a [Host],
    fingerprints: BTreeMap<CertificateType, String>,
}

impl<'a> ServiceBuilder<'a> {
    pub fn new(config: &'a ClusterConfig, defaults: &'a SystemDefaults, etcd_hosts: &'a [Host]) -> Self {
        Self {
            config,
            defaults,
            etcd_hosts,
            fingerprints: BTreeMap::new(),
        }
    }

    /// Labels each service with the certificates it reads, so rotating one
    /// of them changes the service spec.
    pub fn with_certificates(mut self, chain: &TrustChain) -> Result<Self, PkiError> {
        for record in chain.records() {
            if let Some(cert_type) = record.cert_type() {
                let digest = record.certificate.digest(MessageDigest::sha256())?;
                self.fingerprints.insert(cert_type, hex::encode(digest));
            }
        }
        Ok(self)
    }

    fn label_certificates(&self, spec: &mut ServiceSpec, used: &[CertificateType]) {
        let fingerprints: Vec<&str> = used
            .iter()
            .filter_map(|cert_type| self.fingerprints.get(cert_type))
            .map(String::as_str)
            .collect();
        if !fingerprints.is_empty() {
            spec.labels
                .insert(CERTIFICATES_LABEL.to_string(), fingerprints.join(","));
        }
    }

    fn service(&self, name: &str, base: &ServiceConfig, upgrade_aware: bool) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: base.image.clone(),
            extra_args: base.extra_args.clone(),
            binds: vec![KUBERNETES_BIND.to_string()],
            network_mode: Some("host".to_string()),
            restart_policy: Some("always".to_string()),
            upgrade_aware,
            ..Default::default()
        }
    }

    pub fn etcd_connection_string(&self) -> String {
        self.etcd_hosts
            .iter()
            .map(|h| format!("http://{}:2379", h.advertise_address))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn etcd_initial_cluster(&self) -> String {
        self.etcd_hosts
            .iter()
            .map(|h| format!("etcd-{}=http://{}:2380", h.hostname, h.advertise_address))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn etcd(&self, host: &Host) -> ServiceSpec {
        let adv = &host.advertise_address;
        let mut spec = self.service(ETCD_CONTAINER_NAME, &self.config.services.etcd, false);
        spec.entrypoint = strings(&["/usr/local/bin/etcd"]);
        spec.args = vec![
            format!("--name=etcd-{}", host.hostname),
            "--data-dir=/etcd-data".to_string(),
            format!("--advertise-client-urls=http://{}:2379,http://{}:4001", adv, adv),
            "--listen-client-urls=http://0.0.0.0:2379".to_string(),
            format!("--initial-advertise-peer-urls=http://{}:2380", adv),
            "--listen-peer-urls=http://0.0.0.0:2380".to_string(),
            "--initial-cluster-token=etcd-cluster-1".to_string(),
            format!("--initial-cluster={}", self.etcd_initial_cluster()),
        ];
        spec.binds = strings(&["/var/lib/etcd:/etcd-data"]);
        spec.network_mode = None;
        spec.port_bindings = strings(&["0.0.0.0:2379:2379", "0.0.0.0:2380:2380"]);
        spec
    }

    pub fn kube_api(&self, host: &Host) -> ServiceSpec {
        let api = &self.config.services.kube_api;
        let mut spec = self.service(KUBE_API_CONTAINER_NAME, &api.base, true);
        spec.entrypoint = strings(&["kube-apiserver"]);
        spec.args = vec![
            "--insecure-bind-address=127.0.0.1".to_string(),
            "--bind-address=0.0.0.0".to_string(),
            "--insecure-port=0".to_string(),
            "--secure-port=6443".to_string(),
            "--cloud-provider=".to_string(),
            "--allow_privileged=true".to_string(),
            format!("--service-cluster-ip-range={}", api.service_cluster_ip_range),
            "--admission-control=ServiceAccount,NamespaceLifecycle,LimitRanger,PersistentVolumeLabel,DefaultStorageClass,ResourceQuota,DefaultTolerationSeconds".to_string(),
            "--runtime-config=batch/v2alpha1".to_string(),
            "--runtime-config=authentication.k8s.io/v1beta1=true".to_string(),
            "--storage-backend=etcd3".to_string(),
            format!("--etcd-servers={}", self.etcd_connection_string()),
            format!("--advertise-address={}", host.advertise_address),
            format!("--client-ca-file={}", ssl(CertificateType::Authority)),
            format!("--tls-cert-file={}", ssl(CertificateType::ApiServer)),
            format!("--tls-private-key-file={}", ssl_key(CertificateType::ApiServer)),
            format!("--service-account-key-file={}", ssl_key(CertificateType::ApiServer)),
            "--authorization-mode=Node,RBAC".to_string(),
        ];
        self.label_certificates(
            &mut spec,
            &[CertificateType::Authority, CertificateType::ApiServer],
        );
        spec
    }

    pub fn kube_controller(&self, _host: &Host) -> ServiceSpec {
        let controller = &self.config.services.kube_controller;
        let mut spec = self.service(KUBE_CONTROLLER_CONTAINER_NAME, &controller.base, true);
        spec.entrypoint = strings(&["kube-controller-manager"]);
        spec.args = vec![
            "--address=0.0.0.0".to_string(),
            "--cloud-provider=".to_string(),
            "--leader-elect=true".to_string(),
            format!("--kubeconfig={}", kubecfg(CertificateType::ControllerManager)),
            "--enable-hostpath-provisioner=false".to_string(),
            "--node-monitor-grace-period=40s".to_string(),
            "--pod-eviction-timeout=5m0s".to_string(),
            "--v=2".to_string(),
            "--allocate-node-cidrs=true".to_string(),
            format!("--cluster-cidr={}", controller.cluster_cidr),
            format!("--service-cluster-ip-range={}", controller.service_cluster_ip_range),
            format!(
                "--service-account-private-key-file={}",
                ssl_key(CertificateType::ApiServer)
            ),
            format!("--root-ca-file={}", ssl(CertificateType::Authority)),
        ];
        self.label_certificates(
            &mut spec,
            &[
                CertificateType::Authority,
                CertificateType::ApiServer,
                CertificateType::ControllerManager,
            ],
        );
        spec
    }

    pub fn scheduler(&self, _host: &Host) -> ServiceSpec {
        let mut spec = self.service(SCHEDULER_CONTAINER_NAME, &self.config.services.scheduler, true);
        spec.entrypoint = strings(&["kube-scheduler"]);
        spec.args = vec![
            "--leader-elect=true".to_string(),
            "--v=2".to_string(),
            "--address=0.0.0.0".to_string(),
            format!("--kubeconfig={}", kubecfg(CertificateType::Scheduler)),
        ];
        self.label_certificates(
            &mut spec,
            &[CertificateType::Authority, CertificateType::Scheduler],
        );
        spec
    }

    pub fn kubelet(&self, host: &Host) -> ServiceSpec {
        let kubelet = &self.config.services.kubelet;
        let mut spec = self.service(KUBELET_CONTAINER_NAME, &kubelet.base, true);
        spec.entrypoint = strings(&["kubelet"]);
        spec.args = vec![
            "--v=2".to_string(),
            "--address=0.0.0.0".to_string(),
            format!("--cluster-domain={}", kubelet.cluster_domain),
            format!("--pod-infra-container-image={}", kubelet.infra_container_image),
            "--cgroup-driver=cgroupfs".to_string(),
            "--cgroups-per-qos=True".to_string(),
            "--enforce-node-allocatable=".to_string(),
            format!("--hostname-override={}", host.hostname),
            format!("--cluster-dns={}", kubelet.cluster_dns_server),
            "--network-plugin=cni".to_string(),
            "--cni-conf-dir=/etc/cni/net.d".to_string(),
            "--cni-bin-dir=/opt/cni/bin".to_string(),
            "--resolv-conf=/etc/resolv.conf".to_string(),
            "--allow-privileged=true".to_string(),
            "--cloud-provider=".to_string(),
            format!("--kubeconfig={}", kubecfg(CertificateType::Node)),
            "--require-kubeconfig=True".to_string(),
        ];
        spec.binds = strings(&[
            KUBERNETES_BIND,
            "/etc/cni:/etc/cni:ro",
            "/opt/cni:/opt/cni:ro",
            "/etc/resolv.conf:/etc/resolv.conf",
            "/sys:/sys:ro",
            "/var/lib/docker:/var/lib/docker:rw",
            "/var/lib/kubelet:/var/lib/kubelet:shared",
            "/var/run:/var/run:rw",
            "/run:/run",
            "/dev:/host/dev",
        ]);
        spec.pid_mode = Some("host".to_string());
        spec.privileged = true;
        self.label_certificates(&mut spec, &[CertificateType::Authority, CertificateType::Node]);
        spec
    }

    pub fn kube_proxy(&self, _host: &Host) -> ServiceSpec {
        let mut spec = self.service(KUBEPROXY_CONTAINER_NAME, &self.config.services.kubeproxy, true);
        spec.entrypoint = vec![
            "kube-proxy".to_string(),
            "--v=2".to_string(),
            "--healthz-bind-address=0.0.0.0".to_string(),
            format!("--kubeconfig={}", kubecfg(CertificateType::Proxy)),
        ];
        spec.privileged = true;
        self.label_certificates(&mut spec, &[CertificateType::Authority, CertificateType::Proxy]);
        spec
    }

    pub fn control_plane_services(&self, host: &Host) -> Vec<ServiceSpec> {
        vec![self.kube_api(host), self.kube_controller(host), self.scheduler(host)]
    }

    pub fn worker_services(&self, host: &Host) -> Vec<ServiceSpec> {
        vec![self.kubelet(host), self.kube_proxy(host)]
    }

    /// One-shot job writing the host's certificates and kubeconfigs under
    /// `/etc/kubernetes/ssl`. Control plane hosts get every identity except
    /// the admin's; other hosts get what kubelet and kube-proxy need.
    pub fn cert_deployer(&self, chain: &TrustChain, host: &Host) -> Result<ServiceSpec, PkiError> {
        let wanted: &[CertificateType] = if host.has_role(HostRole::Controlplane) {
            &[
                CertificateType::Authority,
                CertificateType::ApiServer,
                CertificateType::ControllerManager,
                CertificateType::Scheduler,
                CertificateType::Proxy,
                CertificateType::Node,
            ]
        } else {
            &[
                CertificateType::Authority,
                CertificateType::Proxy,
                CertificateType::Node,
            ]
        };

        let mut env = Vec::new();
        for cert_type in wanted {
            let record = chain
                .get_type(*cert_type)
                .ok_or_else(|| PkiError::MissingCertificate(cert_type.name().to_string()))?;
            env.extend(record_env(record)?);
        }

        Ok(ServiceSpec {
            name: CERT_DEPLOYER_CONTAINER_NAME.to_string(),
            image: self.defaults.cert_deployer_image.clone(),
            entrypoint: strings(&["cert-deployer"]),
            env,
            binds: vec![KUBERNETES_BIND.to_string()],
            privileged: true,
            ..Default::default()
        })
    }

    /// One-shot kubectl job applying the network plugin manifest, if any.
    pub fn network_plugin_job(&self, chain: &TrustChain) -> Result<Option<ServiceSpec>, PkiError> {
        let manifest = match &self.config.network.manifest {
            Some(manifest) if !manifest.trim().is_empty() => manifest,
            _ => return Ok(None),
        };
        let admin = chain
            .get_type(CertificateType::Admin)
            .ok_or_else(|| PkiError::MissingCertificate(CertificateType::Admin.name().to_string()))?;
        let admin_config = admin
            .config
            .as_deref()
            .ok_or_else(|| PkiError::MissingCertificate(format!("{} kubeconfig", admin.name)))?;

        let kubelet = &self.config.services.kubelet;
        let script = format!(
            "echo \"${}\" > /tmp/kubeconfig && echo \"${}\" | kubectl --kubeconfig /tmp/kubeconfig apply -f -",
            admin.config_env_name, ADDON_MANIFEST_ENV
        );

        Ok(Some(ServiceSpec {
            name: NETWORK_JOB_CONTAINER_NAME.to_string(),
            image: self.defaults.kubectl_image.clone(),
            entrypoint: strings(&["sh", "-c"]),
            args: vec![script],
            env: vec![
                format!("{}={}", admin.config_env_name, admin_config),
                format!(
                    "{}={}",
                    CLUSTER_CIDR_ENV, self.config.services.kube_controller.cluster_cidr
                ),
                format!("{}={}", CLUSTER_DNS_SERVER_ENV, kubelet.cluster_dns_server),
                format!("{}={}", CLUSTER_DOMAIN_ENV, self.config.cluster_domain),
                format!("{}={}", ADDON_MANIFEST_ENV, manifest),
            ],
            network_mode: Some("host".to_string()),
            ..Default::default()
        }))
    }
}

fn record_env(record: &CertificateRecord) -> Result<Vec<String>, PkiError> {
    let mut env = vec![
        format!("{}={}", record.env_name, record.certificate_pem()?),
        format!("{}={}", record.key_env_name, record.key_pem()?),
    ];
    if let Some(config) = &record.config {
        env.push(format!("{}={}", record.config_env_name, config));
    }
    Ok(env)
}
