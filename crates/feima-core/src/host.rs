//! Contracts the editor host fulfils for the bridge.
//!
//! The host owns the encrypted secret vault and the external browser; the
//! bridge only ever sees these two seams. Both traits are object safe so
//! services can hold `Arc<dyn ...>` handles supplied at activation.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("secret store failure: {0}")]
    SecretStore(String),

    #[error("cannot open external URL: {0}")]
    OpenUrl(String),
}

/// Encrypted key/value storage provided by the host.
///
/// The bridge uses exactly one key (`feimaAuth.tokens`); values are opaque
/// JSON blobs. Implementations must be safe to call from multiple tasks.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, HostError>;
    async fn store(&self, key: &str, value: &str) -> Result<(), HostError>;
    async fn delete(&self, key: &str) -> Result<(), HostError>;
}

/// Opens a URL in the user's default browser via the host.
#[async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open_external(&self, url: &str) -> Result<(), HostError>;
}

/// Process-local secret store for headless runs and tests.
#[derive(Default)]
pub struct InMemorySecretStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), HostError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
