//! Partitioned cache storage.
//!
//! Every partition is an independent key → [`CacheEntry`] map. Nothing in
//! one partition is visible through another partition's name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use docket_net::{parse_http_date, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{Result, ServiceWorkerError};

// ==================== Cache Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Normalised request identity.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Stored at (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a response for storage.
    pub fn from_response(key: &str, response: &Response, cached_at: i64) -> Self {
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers.iter() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Self {
            url: key.to_string(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at,
        }
    }

    /// Rebuild a response served from cache.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, value);
            }
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone().into(),
            from_cache: true,
        }
    }

    /// Parsed `Date` header of the stored response.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.headers.get("date").and_then(|d| parse_http_date(d))
    }
}

/// Whether an entry is older than `max_age_seconds`.
///
/// Age is measured from the stored `Date` header. An entry without one, or a
/// rule without a max age, never expires. Exactly `max_age_seconds` old is
/// still fresh.
pub fn is_expired(entry: &CacheEntry, max_age_seconds: Option<u64>, now: DateTime<Utc>) -> bool {
    let (Some(max_age), Some(date)) = (max_age_seconds, entry.date()) else {
        return false;
    };
    let max_age = Duration::seconds(i64::try_from(max_age).unwrap_or(i64::MAX / 1000));
    now.signed_duration_since(date) > max_age
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

// ==================== Partition ====================

/// A single named partition.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Partition {
    /// Partition name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Partition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the least recently stored entries until at most `max_entries` remain.
    pub fn evict_oldest(&mut self, max_entries: usize) -> usize {
        if self.entries.len() <= max_entries {
            return 0;
        }
        let mut by_age: Vec<(i64, String)> = self
            .entries
            .values()
            .map(|e| (e.cached_at, e.url.clone()))
            .collect();
        by_age.sort();

        let excess = self.entries.len() - max_entries;
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }
}

// ==================== Cache Store ====================

/// Persistent, name-partitioned request → response storage.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a key inside one partition.
    async fn match_entry(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Look up a key across all partitions, in name order.
    async fn match_any(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, creating the partition if needed. Last write wins.
    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<()>;

    /// Delete one entry.
    async fn delete(&self, partition: &str, key: &str) -> Result<bool>;

    /// Keys stored in a partition (empty if it does not exist).
    async fn keys(&self, partition: &str) -> Result<Vec<String>>;

    /// Names of all partitions.
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Delete a whole partition.
    async fn delete_partition(&self, partition: &str) -> Result<bool>;

    /// Evict least recently stored entries beyond `max_entries`.
    async fn trim(&self, partition: &str, max_entries: usize) -> Result<usize>;

    async fn entry_count(&self, partition: &str) -> Result<usize> {
        Ok(self.keys(partition).await?.len())
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.partitions().await?.iter().any(|p| p == partition))
    }
}

// ==================== Memory Store ====================

/// In-memory store. Lives as long as the process; used in tests and as the
/// `memory` storage backend.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn match_entry(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .and_then(|p| p.match_request(key))
            .cloned())
    }

    async fn match_any(&self, key: &str) -> Result<Option<CacheEntry>> {
        let partitions = self.partitions.read().await;
        let mut names: Vec<&String> = partitions.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .find_map(|name| partitions[name].match_request(key))
            .cloned())
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<()> {
        trace!(partition, key = %entry.url, "Storing entry");
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_insert_with(|| Partition::new(partition))
            .put(entry);
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        Ok(self
            .partitions
            .write()
            .await
            .get_mut(partition)
            .is_some_and(|p| p.delete(key)))
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .map(Partition::keys)
            .unwrap_or_default())
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.partitions.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.partitions.write().await.remove(partition).is_some())
    }

    async fn trim(&self, partition: &str, max_entries: usize) -> Result<usize> {
        Ok(self
            .partitions
            .write()
            .await
            .get_mut(partition)
            .map(|p| p.evict_oldest(max_entries))
            .unwrap_or(0))
    }
}

// ==================== Disk Store ====================

/// Store persisted as one JSON file per partition under a root directory.
///
/// Writes are read-modify-write of the whole partition file and are
/// serialised by a mutex; files are replaced by rename so readers never see a
/// half-written partition.
#[derive(Debug)]
pub struct DiskCacheStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

const PARTITION_EXT: &str = "json";

impl DiskCacheStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened disk cache store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{PARTITION_EXT}", urlencoding::encode(name)))
    }

    async fn load(&self, name: &str) -> Result<Option<Partition>> {
        let path = self.partition_path(name);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let partition: Partition = serde_json::from_slice(&raw).map_err(|e| {
            ServiceWorkerError::Cache(format!("corrupt partition file {}: {e}", path.display()))
        })?;
        Ok(Some(partition))
    }

    async fn save(&self, partition: &Partition) -> Result<()> {
        let path = self.partition_path(&partition.name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(partition)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn match_entry(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .load(partition)
            .await?
            .and_then(|p| p.match_request(key).cloned()))
    }

    async fn match_any(&self, key: &str) -> Result<Option<CacheEntry>> {
        for name in self.partitions().await? {
            if let Some(entry) = self.match_entry(&name, key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self
            .load(partition)
            .await?
            .unwrap_or_else(|| Partition::new(partition));
        trace!(partition, key = %entry.url, "Storing entry on disk");
        stored.put(entry);
        self.save(&stored).await
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut stored) = self.load(partition).await? else {
            return Ok(false);
        };
        let removed = stored.delete(key);
        if removed {
            self.save(&stored).await?;
        }
        Ok(removed)
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        Ok(self
            .load(partition)
            .await?
            .map(|p| p.keys())
            .unwrap_or_default())
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(name) => names.push(name.into_owned()),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable partition file"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.partition_path(partition)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn trim(&self, partition: &str, max_entries: usize) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(mut stored) = self.load(partition).await? else {
            return Ok(0);
        };
        let evicted = stored.evict_oldest(max_entries);
        if evicted > 0 {
            self.save(&stored).await?;
        }
        Ok(evicted)
    }
}
