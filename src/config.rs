//! Persistent client configuration model and defaults.

use std::time::Duration;

use crate::mutation_coordinator::UploadPolicy;
use crate::track_cache::Freshness;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Remote track API connection.
    pub api: ApiConfig,
    #[serde(default)]
    /// Address and search box behavior.
    pub query: QueryConfig,
    #[serde(default)]
    /// Freshness, eviction and on-disk mirror of the catalog cache.
    pub cache: CacheConfig,
    #[serde(default)]
    /// Constraints checked before an audio upload leaves the client.
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct QueryConfig {
    #[serde(default = "default_search_debounce_ms")]
    pub search_debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_list_stale_secs")]
    pub list_stale_secs: u64,
    #[serde(default = "default_track_stale_secs")]
    pub track_stale_secs: u64,
    #[serde(default = "default_genres_stale_secs")]
    pub genres_stale_secs: u64,
    #[serde(default = "default_gc_idle_secs")]
    pub gc_idle_secs: u64,
    #[serde(default = "default_true")]
    pub persist_enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            search_debounce_ms: default_search_debounce_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            list_stale_secs: default_list_stale_secs(),
            track_stale_secs: default_track_stale_secs(),
            genres_stale_secs: default_genres_stale_secs(),
            gc_idle_secs: default_gc_idle_secs(),
            persist_enabled: true,
            retention_days: default_retention_days(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

impl ApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// How long a request may stay unanswered before it is given up on.
    pub fn abandon_after(&self) -> Duration {
        self.request_timeout()
            .saturating_mul(2)
            .saturating_add(self.connect_timeout())
    }
}

impl QueryConfig {
    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Freshness {
        Freshness {
            track_list: Duration::from_secs(self.list_stale_secs),
            track: Duration::from_secs(self.track_stale_secs),
            genres: Duration::from_secs(self.genres_stale_secs),
        }
    }

    pub fn gc_idle(&self) -> Duration {
        Duration::from_secs(self.gc_idle_secs)
    }
}

impl UploadConfig {
    pub fn policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_bytes: self.max_file_size_mb.saturating_mul(1024 * 1024),
            allowed_content_types: self.allowed_content_types.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_search_debounce_ms() -> u64 {
    400
}

fn default_list_stale_secs() -> u64 {
    5 * 60
}

fn default_track_stale_secs() -> u64 {
    5 * 60
}

fn default_genres_stale_secs() -> u64 {
    30 * 60
}

fn default_gc_idle_secs() -> u64 {
    5 * 60
}

fn default_retention_days() -> u32 {
    7
}

fn default_max_file_size_mb() -> u64 {
    50
}

fn default_allowed_content_types() -> Vec<String> {
    vec!["audio/mpeg".to_string(), "audio/wav".to_string()]
}
