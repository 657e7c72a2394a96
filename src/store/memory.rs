use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CredentialStore, SecretFields, StoreError};

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: Mutex<HashMap<String, SecretFields>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secret_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .secrets
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn has_blob(&self, key: &str) -> bool {
        self.blobs
            .lock()
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn put_secret(&self, name: &str, fields: &SecretFields) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .map_err(poisoned)?
            .insert(name.to_string(), fields.clone());
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<SecretFields, StoreError> {
        self.secrets
            .lock()
            .map_err(poisoned)?
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("secret {}", name)))
    }

    async fn put_config_blob(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get_config_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .map_err(poisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("config {}", key)))
    }
}
