//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::{DocketError, Result};

/// Partition holding the serialized offline queues. Deliberately unversioned so
/// pending writes survive a generation cutover.
pub const QUEUE_PARTITION: &str = "queue-storage";

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "DOCKET_CONFIG";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Origin the engine is installed for; relative paths resolve against it
    pub origin: Url,

    /// Prefix shared by every versioned partition
    pub cache_prefix: String,

    /// Active cache generation
    pub version: String,

    /// Where partitions are persisted
    pub storage: StorageConfig,

    /// Paths pre-fetched into the primary partition at install
    pub essential_resources: Vec<String>,

    /// Offline page served for failed navigations
    pub offline_page: String,

    /// Icon served for failed image requests
    pub fallback_image: String,

    /// Ordered routing table; first match wins
    pub routes: Vec<RouteConfig>,

    /// Educational content route with payload screening
    pub education: EducationConfig,

    /// URL patterns that bypass the engine entirely
    pub sensitive_paths: Vec<String>,

    /// Keywords that veto caching of education payloads
    pub sensitive_keywords: Vec<String>,

    /// Queries re-fetched on the search-cache sync tag
    pub popular_searches: Vec<String>,

    /// Endpoint queued uploads are delivered to
    pub upload_endpoint: String,

    /// Endpoint queued annotations are delivered to
    pub annotation_endpoint: String,

    /// Push notification defaults
    pub notification: NotificationDefaults,

    /// User agent for the HTTP client
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Disk { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub pattern: String,

    /// One of cache-first, network-first, stale-while-revalidate,
    /// network-only, cache-only
    pub strategy: String,

    /// Short store name, expanded to `<prefix>-<store>-<version>`
    pub store: String,

    #[serde(default)]
    pub max_age_seconds: Option<u64>,

    #[serde(default)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EducationConfig {
    pub pattern: String,
    pub store: String,
    pub disclaimer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub url: String,
    pub tag: String,
    pub icon: String,
    pub badge: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("https://app.docket.local/").expect("static origin is valid"),
            cache_prefix: "docket".to_string(),
            version: "v1".to_string(),
            storage: StorageConfig::default(),
            essential_resources: vec![
                "/".to_string(),
                "/offline.html".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            offline_page: "/offline.html".to_string(),
            fallback_image: "/icons/icon-192x192.png".to_string(),
            routes: default_routes(),
            education: EducationConfig::default(),
            sensitive_paths: [
                "privileged",
                "confidential",
                "attorney-client",
                "authentication",
                "/login",
                "/oauth",
                "work-product",
            ]
            .iter()
            .map(|p| format!("(?i){p}"))
            .collect(),
            sensitive_keywords: [
                "privileged",
                "confidential",
                "client-info",
                "attorney-client",
                "work-product",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            popular_searches: [
                "statute of limitations",
                "motion to dismiss",
                "discovery deadlines",
                "summary judgment",
            ]
            .iter()
            .map(|q| q.to_string())
            .collect(),
            upload_endpoint: "/api/documents/upload".to_string(),
            annotation_endpoint: "/api/annotations".to_string(),
            notification: NotificationDefaults::default(),
            user_agent: format!("DocketOffline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Disk {
            path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docket"),
        }
    }
}

impl Default for EducationConfig {
    fn default() -> Self {
        Self {
            pattern: r"/api/education/".to_string(),
            store: "education".to_string(),
            disclaimer: "This educational content is general information and is not legal advice."
                .to_string(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Docket".to_string(),
            body: "You have a new update".to_string(),
            url: "/".to_string(),
            tag: "docket-notification".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/badge-72x72.png".to_string(),
        }
    }
}

fn route(
    pattern: &str,
    strategy: &str,
    store: &str,
    max_age_seconds: Option<u64>,
    max_entries: Option<usize>,
) -> RouteConfig {
    RouteConfig {
        pattern: pattern.to_string(),
        strategy: strategy.to_string(),
        store: store.to_string(),
        max_age_seconds,
        max_entries,
    }
}

const DAY: u64 = 24 * 60 * 60;

fn default_routes() -> Vec<RouteConfig> {
    vec![
        route(r"/api/.*/documents/", "network-first", "documents", Some(DAY), Some(50)),
        route(r"/api/search", "stale-while-revalidate", "search", Some(60 * 60), Some(50)),
        route(
            r"/api/(statutes|regulations|court-rules)/",
            "cache-first",
            "legal-resources",
            Some(7 * DAY),
            Some(200),
        ),
        route(r"/api/(analytics|billing)/", "network-only", "api", None, None),
        route(r"/api/offline-forms/", "cache-only", "forms", None, None),
        route(r"/api/", "network-first", "api", Some(5 * 60), Some(100)),
        route(
            r"\.(?:js|css|woff2?|ttf)(?:\?.*)?$",
            "cache-first",
            "static",
            Some(30 * DAY),
            Some(100),
        ),
        route(
            r"\.(?:png|jpe?g|gif|svg|webp|ico)(?:\?.*)?$",
            "cache-first",
            "images",
            Some(7 * DAY),
            Some(60),
        ),
    ]
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DocketError::config_with_source(format!("reading {}", path.display()), e)
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            DocketError::config_with_source(format!("parsing {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$DOCKET_CONFIG` if set, defaults otherwise.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(DocketError::config(format!(
                "origin must be http(s), got {}",
                self.origin
            )));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(DocketError::config("cache_prefix must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(DocketError::config("version must not be empty"));
        }
        if self.cache_prefix.contains(&self.version) {
            return Err(DocketError::config(
                "cache_prefix must not contain the version string",
            ));
        }
        Ok(())
    }

    /// Primary partition (essential resources, navigations).
    pub fn primary_partition(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Versioned partition for a route's short store name.
    pub fn partition_name(&self, store: &str) -> String {
        format!("{}-{}-{}", self.cache_prefix, store, self.version)
    }

    /// Resolve a configured path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| DocketError::InvalidArgument(format!("{path}: {e}")))
    }
}
