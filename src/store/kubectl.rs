// src/store/kubectl.rs
use std::path::PathBuf;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::{CredentialStore, SecretFields, StoreError};

pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Stores secrets and config maps through `kubectl` using the admin kubeconfig.
#[derive(Debug, Clone)]
pub struct KubectlStore {
    kubeconfig: PathBuf,
    namespace: String,
    kubectl: String,
}

impl KubectlStore {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            namespace: SYSTEM_NAMESPACE.to_string(),
            kubectl: "kubectl".to_string(),
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<Vec<u8>, StoreError> {
        debug!("Running kubectl {}", args.join(" "));
        let output = Command::new(&self.kubectl)
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .arg("--namespace")
            .arg(&self.namespace)
            .args(args)
            .output()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to run kubectl: {}", e)))?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(output.stdout)
    }

    /// Applies a manifest from a temporary file, removed afterwards.
    async fn apply(&self, manifest: &Value) -> Result<(), StoreError> {
        let path = std::env::temp_dir().join(format!("kube-bootstrap-{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec(manifest).map_err(|e| StoreError::Rejected(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to write manifest: {}", e)))?;

        let path_str = path.to_string_lossy().to_string();
        let result = self.kubectl(&["apply", "-f", &path_str]).await;
        let _ = tokio::fs::remove_file(&path).await;
        result.map(|_| ())
    }

    async fn get_object(&self, kind: &str, name: &str) -> Result<Value, StoreError> {
        let stdout = self.kubectl(&["get", kind, name, "-o", "json"]).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| StoreError::Unavailable(format!("unreadable {} {}: {}", kind, name, e)))
    }
}

fn classify_failure(stderr: &str) -> StoreError {
    let message = stderr.trim().to_string();
    if message.contains("NotFound") || message.contains("not found") {
        StoreError::NotFound(message)
    } else if message.contains("Forbidden") || message.contains("is invalid") {
        StoreError::Rejected(message)
    } else {
        StoreError::Unavailable(message)
    }
}

fn secret_manifest(name: &str, namespace: &str, fields: &SecretFields) -> Value {
    let data: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(STANDARD.encode(value))))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": { "name": name, "namespace": namespace },
        "data": data,
    })
}

fn config_map_manifest(key: &str, namespace: &str, data: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": key, "namespace": namespace },
        "data": { key: data },
    })
}

fn secret_fields_from(object: &Value) -> Result<SecretFields, StoreError> {
    let mut fields = SecretFields::new();
    if let Some(data) = object.get("data").and_then(Value::as_object) {
        for (key, value) in data {
            let encoded = value
                .as_str()
                .ok_or_else(|| StoreError::Rejected(format!("secret field {} is not a string", key)))?;
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|e| StoreError::Rejected(format!("secret field {}: {}", key, e)))?;
            fields.insert(key.clone(), decoded);
        }
    }
    Ok(fields)
}

#[async_trait]
impl CredentialStore for KubectlStore {
    async fn put_secret(&self, name: &str, fields: &SecretFields) -> Result<(), StoreError> {
        self.apply(&secret_manifest(name, &self.namespace, fields)).await
    }

    async fn get_secret(&self, name: &str) -> Result<SecretFields, StoreError> {
        let object = self.get_object("secret", name).await?;
        secret_fields_from(&object)
    }

    async fn put_config_blob(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| StoreError::Rejected(format!("config {} is not UTF-8: {}", key, e)))?;
        self.apply(&config_map_manifest(key, &self.namespace, text)).await
    }

    async fn get_config_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let object = self.get_object("configmap", key).await?;
        object
            .get("data")
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| StoreError::NotFound(format!("config {} has no data", key)))
    }
}
