//! Service configuration fetched from the surrounding platform.
//!
//! Only two keys matter here: the tokenizer allow-list and whether the
//! deployment is managed. The cache holds the last fetched value for a fixed
//! TTL and can be invalidated explicitly when the platform announces a change.

use crate::{Error, Result};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// Default lifetime of a cached configuration.
pub const CONFIG_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Tokenizer configuration identifiers that may be loaded.
    pub tokenizer_allow_list: Vec<String>,
    /// Managed deployments persist a tokenizer descriptor per project for
    /// the inference side.
    #[serde(default)]
    pub is_managed: bool,
}

impl ServiceConfig {
    pub fn allows(&self, config_id: &str) -> bool {
        self.tokenizer_allow_list.iter().any(|id| id == config_id)
    }
}

/// Where the configuration comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<ServiceConfig>;
}

/// A [`ConfigSource`] that always returns the same value.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    config: ServiceConfig,
}

impl StaticConfigSource {
    pub const fn new(config: ServiceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<ServiceConfig> {
        if self.config.tokenizer_allow_list.is_empty() {
            return Err(Error::Config {
                reason: "tokenizer allow-list is empty".to_owned(),
            });
        }
        Ok(self.config.clone())
    }
}

/// TTL cache in front of a [`ConfigSource`].
pub struct ConfigCache {
    source: Arc<dyn ConfigSource>,
    ttl: Duration,
    cached: RwLock<Option<(ServiceConfig, Instant)>>,
}

impl ConfigCache {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self::with_ttl(source, CONFIG_TTL)
    }

    pub fn with_ttl(source: Arc<dyn ConfigSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Returns the cached configuration, fetching it when absent or stale.
    ///
    /// # Errors
    ///
    /// Propagates the error of the underlying [`ConfigSource`]. A failed
    /// fetch leaves the previous (stale) value in place but does not return
    /// it.
    pub async fn get(&self) -> Result<ServiceConfig> {
        if let Some((config, fetched_at)) = self.cached.read().as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(config.clone());
            }
        }

        let config = self.source.fetch().await?;
        *self.cached.write() = Some((config.clone(), Instant::now()));
        tracing::debug!(
            allow_list = ?config.tokenizer_allow_list,
            is_managed = config.is_managed,
            "Fetched service config"
        );
        Ok(config)
    }

    /// Drops the cached value so that the next [`Self::get`] refetches.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn fetch(&self) -> Result<ServiceConfig> {
            let n = self.fetches.fetch_add(1, Ordering::Relaxed);
            Ok(ServiceConfig {
                tokenizer_allow_list: vec![format!("model_{n}")],
                is_managed: false,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_refetches_after_ttl_and_invalidate() {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
        });
        let cache = ConfigCache::with_ttl(source.clone(), Duration::from_secs(10));

        assert!(cache.get().await.unwrap().allows("model_0"));
        assert!(cache.get().await.unwrap().allows("model_0"));
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get().await.unwrap().allows("model_1"));

        cache.invalidate();
        assert!(cache.get().await.unwrap().allows("model_2"));
        assert_eq!(source.fetches.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn empty_allow_list_is_a_config_error() {
        let cache = ConfigCache::new(Arc::new(StaticConfigSource::new(ServiceConfig::default())));
        assert!(matches!(cache.get().await, Err(Error::Config { .. })));
    }
}
