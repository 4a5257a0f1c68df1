use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Ledger DSN (PostgreSQL or SQLite)
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/picstream.db"),
        }
    }
}

impl DatabaseConfig {
    /// In-memory ledger, used by tests and single-process setups
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// Configuration for the broker behind the transport abstraction
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend type ("memory" or "nats")
    pub queue_type: String,
    /// Connection URL
    pub url: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_type: "memory".to_string(),
            url: "memory://local".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object store DSN: `memory://` or `s3://[key:secret@]host[:port]`
    pub dsn: String,
    /// Public host for presigned URLs. Internal hosts in generated URLs are
    /// rewritten to this endpoint so browsers outside the deployment network
    /// can reach the store directly.
    pub public_endpoint: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: "memory://".to_string(),
            public_endpoint: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live for cached read views
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Upper bound on cached entries
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2 * 60 * 60),
            max_entries: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bucket namespace for newly reserved objects
    pub bucket: String,
    /// Hard ceiling on the caller-chosen reservation lifetime
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: "images".to_string(),
            max_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Pause between reclamation sweeps
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Age after which a pending delete is assumed to have lost its job and
    /// gets re-enqueued
    #[serde(with = "humantime_serde")]
    pub redrive_after: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            redrive_after: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Default page size for the feed
    pub feed_limit: i64,
    /// Maximum page size a caller may request
    pub max_feed_limit: i64,
    /// Expiry of presigned download URLs handed to readers
    #[serde(with = "humantime_serde")]
    pub url_ttl: Duration,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            feed_limit: 20,
            max_feed_limit: 100,
            url_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub upload: UploadConfig,
    pub reclaim: ReclaimConfig,
    pub serving: ServingConfig,
}

impl Configuration {
    /// Load configuration from defaults, `picstream.toml` and `PICSTREAM__*`
    /// environment variables, in increasing priority.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("picstream.toml"))
            .merge(Env::prefixed("PICSTREAM__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
