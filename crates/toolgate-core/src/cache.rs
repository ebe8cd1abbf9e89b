//! TTL + LRU cache of tool descriptors with single-flight fetches.
//!
//! Descriptors are expensive to fetch (a downstream round-trip) and shared
//! across concurrent executions. The cache guarantees that two concurrent
//! callers for the same tool perform exactly one downstream fetch, serves
//! stale entries when a refresh fails (stale-on-error), and persists itself
//! to `<state-dir>/schema-cache.json` so restarts start warm.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use toolgate_error::GatewayError;

use crate::descriptor::{ToolDescriptor, ToolName};

/// Source of fresh tool descriptors, implemented by the downstream pool.
#[async_trait::async_trait]
pub trait SchemaSource: Send + Sync {
    /// Fetch the descriptor for one tool from its downstream server.
    async fn fetch_descriptor(&self, name: &ToolName) -> Result<ToolDescriptor, GatewayError>;

    /// Fetch descriptors for every tool on every configured server.
    async fn fetch_all_descriptors(&self) -> Result<Vec<ToolDescriptor>, GatewayError>;
}

/// Configuration for the schema cache.
#[derive(Debug, Clone)]
pub struct SchemaCacheConfig {
    /// Maximum live entries.
    pub max_entries: usize,
    /// Descriptor time-to-live.
    pub ttl: Duration,
    /// Where to persist the cache, when set.
    pub disk_path: Option<PathBuf>,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(24 * 60 * 60),
            disk_path: None,
        }
    }
}

/// A cached descriptor with its fetch timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    descriptor: Arc<ToolDescriptor>,
    fetched_at: DateTime<Utc>,
}

/// Shared TTL + LRU schema cache.
pub struct SchemaCache {
    config: SchemaCacheConfig,
    source: Arc<dyn SchemaSource>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    /// Per-tool-name fetch locks. Holding one across check-fetch-insert is
    /// what makes fetches single-flight.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    disk_lock: Mutex<()>,
}

impl SchemaCache {
    /// Create a cache backed by the given source.
    pub fn new(config: SchemaCacheConfig, source: Arc<dyn SchemaSource>) -> Self {
        let capacity =
            NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            config,
            source,
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            disk_lock: Mutex::new(()),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.fetched_at);
        age.to_std().map(|a| a < self.config.ttl).unwrap_or(true)
    }

    /// Get the descriptor for a tool, fetching (once) when missing or stale.
    ///
    /// On fetch failure a stale entry, if present, is served with a warning
    /// (stale-on-error); otherwise the call fails closed with
    /// `schema-unavailable`.
    pub async fn get_tool_schema(
        &self,
        name: &ToolName,
    ) -> Result<Arc<ToolDescriptor>, GatewayError> {
        let key = name.qualified();

        // Fast path: fresh entry already cached.
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry) {
                    return Ok(entry.descriptor.clone());
                }
            }
        }

        // Take the per-key fetch lock so only one caller fetches.
        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _fetch_guard = key_lock.lock().await;

        // Re-check under the fetch lock: a concurrent caller may have
        // completed the fetch while we waited.
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry) {
                    self.release_inflight(&key).await;
                    return Ok(entry.descriptor.clone());
                }
            }
        }

        let result = self.source.fetch_descriptor(name).await;
        let outcome = match result {
            Ok(descriptor) => {
                let descriptor = Arc::new(descriptor);
                let entry = CacheEntry {
                    descriptor: descriptor.clone(),
                    fetched_at: Utc::now(),
                };
                self.entries.lock().await.put(key.clone(), entry);
                if let Err(e) = self.persist().await {
                    tracing::warn!(error = %e, "failed to persist schema cache");
                }
                Ok(descriptor)
            }
            Err(fetch_err) => {
                let stale = {
                    let mut entries = self.entries.lock().await;
                    entries.get(&key).map(|e| e.descriptor.clone())
                };
                match stale {
                    Some(descriptor) => {
                        tracing::warn!(
                            tool = %key,
                            error = %fetch_err,
                            "schema refresh failed, serving stale descriptor"
                        );
                        Ok(descriptor)
                    }
                    None => Err(GatewayError::SchemaUnavailable {
                        tool: key.clone(),
                        message: fetch_err.to_string(),
                    }),
                }
            }
        };

        self.release_inflight(&key).await;
        outcome
    }

    async fn release_inflight(&self, key: &str) {
        self.inflight.lock().await.remove(key);
    }

    /// All live descriptors, most-recently-used first.
    pub async fn list_cached(&self) -> Vec<Arc<ToolDescriptor>> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|(_, entry)| entry.descriptor.clone())
            .collect()
    }

    /// Fetch and cache descriptors for every configured tool.
    pub async fn refresh_all(&self) -> Result<Vec<Arc<ToolDescriptor>>, GatewayError> {
        let descriptors = self.source.fetch_all_descriptors().await?;
        let now = Utc::now();
        let mut out = Vec::with_capacity(descriptors.len());
        {
            let mut entries = self.entries.lock().await;
            for descriptor in descriptors {
                let descriptor = Arc::new(descriptor);
                entries.put(
                    descriptor.name.clone(),
                    CacheEntry {
                        descriptor: descriptor.clone(),
                        fetched_at: now,
                    },
                );
                out.push(descriptor);
            }
        }
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "failed to persist schema cache");
        }
        Ok(out)
    }

    /// Drop one entry.
    pub async fn invalidate(&self, name: &ToolName) {
        self.entries.lock().await.pop(&name.qualified());
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write the cache to disk as `{name: {descriptor, fetchedAt}}`.
    ///
    /// Serialized by the disk-write lock so concurrent writers cannot
    /// interleave. A cache without a configured path is a no-op.
    pub async fn persist(&self) -> Result<(), GatewayError> {
        let Some(path) = &self.config.disk_path else {
            return Ok(());
        };

        let snapshot: HashMap<String, CacheEntry> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let _guard = self.disk_lock.lock().await;
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("cache serialize: {e}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!("cache dir: {e}")))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("cache write: {e}")))?;
        Ok(())
    }

    /// Load the cache from disk, best-effort.
    ///
    /// A missing or corrupt file leaves the cache empty and logs a warning;
    /// startup never fails on cache state. Loaded entries keep their
    /// original fetch timestamps, so TTL expiry carries across restarts.
    pub async fn load(&self) {
        let Some(path) = &self.config.disk_path else {
            return;
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read schema cache");
                return;
            }
        };
        let snapshot: HashMap<String, CacheEntry> = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "schema cache file is corrupt, starting empty"
                );
                return;
            }
        };

        let mut entries = self.entries.lock().await;
        for (key, entry) in snapshot {
            entries.put(key, entry);
        }
    }
}
