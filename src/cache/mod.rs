//! Caching plane: a pluggable key/value capability with typed stores on top.
//!
//! Two backends implement the same semantics: an in-process map and a
//! Redis client. Stores treat every backend error as a miss (logged at
//! debug level) so a dead cache degrades to slower relay fetches, never to
//! user-visible failures.

pub mod memory;
pub mod rate_limit;
pub mod remote;
pub mod stores;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use rate_limit::RateLimiter;
pub use remote::RedisBackend;
pub use stores::{CachePlane, Cached, Store};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend closed")]
    Closed,
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// The key/value capability. Values are opaque bytes; every entry carries a
/// TTL. Implementations must be safe for concurrent use.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Positional results: `result[i]` answers `keys[i]`.
    async fn get_multiple(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    async fn set_multiple(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn close(&self) -> Result<(), CacheError>;
}

/// Build the backend from configuration: a Redis URL selects the remote
/// backend, absence selects the in-process one.
pub async fn backend_from_config(redis_url: Option<&str>) -> Arc<dyn KvBackend> {
    match redis_url {
        Some(url) => match RedisBackend::connect(url).await {
            Ok(backend) => {
                tracing::info!("cache backend: redis");
                Arc::new(backend)
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, using in-process cache");
                Arc::new(MemoryBackend::new())
            }
        },
        None => {
            tracing::debug!("cache backend: in-process");
            Arc::new(MemoryBackend::new())
        }
    }
}
