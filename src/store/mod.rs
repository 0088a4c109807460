//! Store access
//!
//! Components hold an `Arc<dyn CoordinationStore>`; which store sits behind
//! it is decided once, from configuration.

mod remote;

pub use remote::{RemoteStore, SubscriptionCreated, SubscriptionPoll, TransactionRequest, TransactionResponse};

use crate::config::{MeshConfig, StoreBackend};
use crate::Result;
use meshstore::{CoordinationStore, MemoryStore};
use std::sync::Arc;

/// Shared handle to the coordination store
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Open the store named by the configuration
pub fn connect(config: &MeshConfig) -> Result<SharedStore> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::debug!("Using in-process coordination store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Remote => {
            tracing::debug!(url = %config.store.url, "Using remote coordination store");
            let store = RemoteStore::new(&config.store.url)?
                .with_timeout(config.store.request_timeout)
                .with_retry(config.retry.clone());
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore::StoreExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_backend() {
        let mut config = MeshConfig::new();
        config.store.backend = StoreBackend::Memory;
        let store = connect(&config).unwrap();
        assert!(store.set_nx_ex("k", "v", Duration::from_secs(1)).await.unwrap());
    }

    #[test]
    fn test_remote_backend_rejects_bad_url() {
        let mut config = MeshConfig::new();
        config.store.url = "::not a url::".to_string();
        assert!(connect(&config).is_err());
    }
}
