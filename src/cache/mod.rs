//! # Cache Module
//!
//! Caching of resolved stream handles.
//!
//! Resolving a search query costs a yt-dlp run of a few seconds. The handle
//! it produces stays valid for a while, so re-queuing the same reference
//! within the TTL skips the extractor. Live streams are never cached.
//!
//! ```env
//! RELAY_CACHE_SIZE=100        # Maximum number of cached handles
//! RELAY_CACHE_TTL_SECS=300    # Time-to-live in seconds
//! ```

pub mod lru_cache;

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    error::ResolutionError,
    sources::{SourceResolver, StreamHandle},
};
use lru_cache::LRUCache;

/// Handle cache keyed by the trimmed user reference.
pub type ResolutionCache = LRUCache<String, StreamHandle>;

impl ResolutionCache {
    /// Performs cache maintenance by removing expired entries.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}

/// Decorates any resolver with a [`ResolutionCache`].
pub struct CachedResolver<R> {
    inner: R,
    cache: ResolutionCache,
    ttl: Duration,
}

impl<R: SourceResolver> CachedResolver<R> {
    pub fn new(inner: R, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            cache: ResolutionCache::new(capacity),
            ttl,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }
}

#[async_trait]
impl<R: SourceResolver> SourceResolver for CachedResolver<R> {
    async fn resolve(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        let key = reference.trim().to_string();

        if let Some(handle) = self.cache.get(&key) {
            debug!("💾 Cache hit: {}", key);
            return Ok(handle);
        }

        let handle = self.inner.resolve(reference).await?;
        if !handle.is_live() {
            self.cache.insert_with_ttl(key, handle.clone(), Some(self.ttl));
        }

        Ok(handle)
    }
}
