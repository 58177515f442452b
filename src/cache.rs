//! Content-addressed persistent response cache.
//!
//! One file per entry under a configured directory, filename = MD5 hex of
//! the request key, contents `{value, created_at, expires_at}`. Grounded on
//! `original_source/pasture_core.py`'s `FileCache`: a process-local lock
//! serializing reads/writes, best-effort persistence (a write failure is
//! logged and dropped, never propagated), and lazy expiry (an expired entry
//! reads as a miss, but the file is left on disk).
//!
//! Cross-process safety is explicitly *not* provided — see spec.md §9, Open
//! Question 3. Two processes racing on the same cache directory may clobber
//! each other's writes; this mirrors the Python original, which only takes
//! an in-process `asyncio.Lock`.

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use schemars::JsonSchema;
use tokio::sync::Mutex;

use crate::prelude::*;

/// A single cache entry, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CacheEntry {
    /// The cached value.
    pub value: Value,

    /// When this entry was created, in seconds since the Unix epoch.
    pub created_at: f64,

    /// When this entry expires, in seconds since the Unix epoch. `None`
    /// means it never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
}

impl CacheEntry {
    /// Has this entry expired, as of `now`? Expiration is strictly
    /// `expires_at < now` per spec.md §4.1.
    fn is_expired(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }
}

/// Aggregate statistics about the cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, JsonSchema)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
    pub cache_size_bytes: u64,
}

/// File-based, content-addressed cache.
#[derive(Debug)]
pub struct FileCache {
    cache_dir: PathBuf,
    /// Serializes all operations against `cache_dir`, same role as the
    /// original's `asyncio.Lock`.
    lock: Mutex<()>,
}

impl FileCache {
    /// Create a cache rooted at `cache_dir`, creating the directory if
    /// necessary.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).with_context(|| {
            format!("failed to create cache directory {:?}", cache_dir)
        })?;
        Ok(Self {
            cache_dir,
            lock: Mutex::new(()),
        })
    }

    /// Hash a cache key into the filename we'll use for it.
    fn hash_key(key: &str) -> String {
        let digest = Md5::digest(key.as_bytes());
        format!("{:x}", digest)
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", Self::hash_key(key)))
    }

    /// Get a value from the cache. Never raises: malformed entries and I/O
    /// errors are logged and treated as a miss.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let _guard = self.lock.lock().await;
        let path = self.path_for_key(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache miss for {key}");
                return None;
            }
            Err(err) => {
                error!("Error reading from cache: {err}");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(entry) => entry,
            Err(err) => {
                error!("Error reading from cache: malformed entry ({err})");
                return None;
            }
        };
        if entry.is_expired(now_as_secs()) {
            debug!("Cache entry for {key} has expired");
            return None;
        }
        debug!("Cache hit for {key}");
        Some(entry.value)
    }

    /// Set a value in the cache with an optional TTL, in seconds.
    ///
    /// Best-effort: on write failure, retries a few times with a short
    /// backoff, then logs and gives up silently per spec.md §4.1.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<f64>) {
        let _guard = self.lock.lock().await;
        let now = now_as_secs();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        };
        let path = self.path_for_key(key);
        let Ok(serialized) = serde_json::to_vec(&entry) else {
            error!("Error writing to cache: failed to serialize entry");
            return;
        };

        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            match tokio::fs::write(&path, &serialized).await {
                Ok(()) => {
                    debug!(
                        "Cached value for {key}{}",
                        ttl.map(|t| format!(" with TTL {t}s")).unwrap_or_default()
                    );
                    return;
                }
                Err(err) if attempt < MAX_ATTEMPTS => {
                    warn!("Error writing to cache (attempt {attempt}): {err}");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        20 * u64::from(attempt),
                    ))
                    .await;
                }
                Err(err) => {
                    error!("Error writing to cache, giving up: {err}");
                }
            }
        }
    }

    /// Remove one cache entry, or every entry if `key` is `None`.
    pub async fn clear(&self, key: Option<&str>) -> Result<()> {
        let _guard = self.lock.lock().await;
        match key {
            Some(key) => {
                let path = self.path_for_key(key);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!("Cleared cache entry for {key}"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("failed to remove cache entry at {:?}", path)
                        });
                    }
                }
            }
            None => {
                let mut dir = tokio::fs::read_dir(&self.cache_dir)
                    .await
                    .context("failed to read cache directory")?;
                while let Some(entry) = dir
                    .next_entry()
                    .await
                    .context("failed to read cache directory entry")?
                {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        tokio::fs::remove_file(&path).await.ok();
                    }
                }
                debug!("Cleared all cache entries");
            }
        }
        Ok(())
    }

    /// Gather statistics about the entries currently on disk.
    pub async fn stats(&self) -> Result<CacheStats> {
        let _guard = self.lock.lock().await;
        let mut stats = CacheStats::default();
        let now = now_as_secs();
        let mut dir = tokio::fs::read_dir(&self.cache_dir)
            .await
            .context("failed to read cache directory")?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context("failed to read cache directory entry")?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            stats.total_entries += 1;
            stats.cache_size_bytes += metadata.len();
            let is_expired = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|data| serde_json::from_str::<CacheEntry>(&data).ok())
                .is_some_and(|entry| entry.is_expired(now));
            if is_expired {
                stats.expired_entries += 1;
            } else {
                stats.active_entries += 1;
            }
        }
        Ok(stats)
    }
}

/// Canonicalize a `(model, prompt, options)` triple into the string used to
/// derive a cache key, per spec.md §4.1. JSON-serializing `options` through
/// `serde_json::to_value` + a `BTreeMap` re-encode makes the result
/// independent of the caller's map iteration order.
pub fn completion_cache_key(model: &str, prompt: &str, options: &Value) -> String {
    format!(
        "{model}:{prompt}:{}",
        canonical_json(options).unwrap_or_else(|_| "{}".to_owned())
    )
}

/// Canonicalize a chat request into a cache key, per spec.md §4.1.
pub fn chat_cache_key(
    model: &str,
    messages: &Value,
    options: &Value,
    format: &Value,
) -> String {
    format!(
        "chat:{model}:{}:{}:{}",
        canonical_json(messages).unwrap_or_else(|_| "[]".to_owned()),
        canonical_json(options).unwrap_or_else(|_| "{}".to_owned()),
        canonical_json(format).unwrap_or_else(|_| "null".to_owned()),
    )
}

/// Serialize a [`Value`] with object keys sorted, so that two semantically
/// equal option maps always hash identically regardless of insertion order.
fn canonical_json(value: &Value) -> Result<String> {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).context("failed to serialize value for cache key")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

pub(crate) fn now_as_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        cache.set("key", json!({"a": 1}), None).await;
        assert_eq!(cache.get("key").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        cache.set("key", json!("value"), Some(-1.0)).await;
        assert_eq!(cache.get("key").await, None);
    }

    #[tokio::test]
    async fn test_missing_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        assert_eq!(cache.get("nope").await, None);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let path = dir.path().join(format!("{}.json", FileCache::hash_key("key")));
        tokio::fs::write(&path, "not json").await.unwrap();
        assert_eq!(cache.get("key").await, None);
    }

    #[tokio::test]
    async fn test_clear_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        cache.set("a", json!(1), None).await;
        cache.set("b", json!(2), None).await;
        cache.clear(Some("a")).await.unwrap();
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        cache.set("a", json!(1), None).await;
        cache.set("b", json!(2), None).await;
        cache.clear(None).await.unwrap();
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_stats_counts_active_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        cache.set("active", json!(1), Some(3600.0)).await;
        cache.set("expired", json!(2), Some(-1.0)).await;
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.expired_entries, 1);
    }

    #[test]
    fn test_cache_key_determinism_regardless_of_option_order() {
        let opts_a = json!({"temperature": 0.7, "top_p": 0.9});
        let opts_b = json!({"top_p": 0.9, "temperature": 0.7});
        assert_eq!(
            completion_cache_key("llama3", "hi", &opts_a),
            completion_cache_key("llama3", "hi", &opts_b)
        );
    }
}
