use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Memory
}

/// One axis of the two-axis rate limiter (§4.J): capacity and refill rate
/// for either the resource bucket or the IP bucket.
#[derive(Clone, Deserialize, Debug)]
pub struct BucketConfig {
    pub capacity: u64,
    pub refill_rate_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate_per_sec: 10.0,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub resource_bucket: BucketConfig,
    #[serde(default)]
    pub ip_bucket: BucketConfig,
    #[serde(default)]
    pub allow_listed_ips: Vec<String>,
    #[serde(default = "default_bucket_ttl_seconds")]
    pub bucket_ttl_seconds: u64,
}

fn default_bucket_ttl_seconds() -> u64 {
    3600
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_bucket: BucketConfig::default(),
            ip_bucket: BucketConfig::default(),
            allow_listed_ips: Vec::new(),
            bucket_ttl_seconds: default_bucket_ttl_seconds(),
        }
    }
}

/// Tunables for the rebroadcast side-channel (§4.I).
#[derive(Clone, Deserialize, Debug)]
pub struct RebroadcastConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_rebroadcasts")]
    pub max_concurrent: usize,
    #[serde(default = "default_min_success_count")]
    pub min_success_count: usize,
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default)]
    pub allowed_sources: Vec<String>,
}

fn default_max_concurrent_rebroadcasts() -> usize {
    4
}
fn default_min_success_count() -> usize {
    1
}
fn default_dedup_ttl_seconds() -> u64 {
    60
}
fn default_dedup_capacity() -> usize {
    10_000
}

impl Default for RebroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: default_max_concurrent_rebroadcasts(),
            min_success_count: default_min_success_count(),
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            dedup_capacity: default_dedup_capacity(),
            allowed_sources: Vec::new(),
        }
    }
}

/// Debounce tunables for the ArNS resolution cache (§4.K).
#[derive(Clone, Deserialize, Debug)]
pub struct ResolutionCacheConfig {
    #[serde(default = "default_hit_debounce_ms")]
    pub cache_hit_debounce_ms: u64,
    #[serde(default = "default_miss_debounce_ms")]
    pub cache_miss_debounce_ms: u64,
}

fn default_hit_debounce_ms() -> u64 {
    60_000
}
fn default_miss_debounce_ms() -> u64 {
    10_000
}

impl Default for ResolutionCacheConfig {
    fn default() -> Self {
        Self {
            cache_hit_debounce_ms: default_hit_debounce_ms(),
            cache_miss_debounce_ms: default_miss_debounce_ms(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_cdb64_shard_dir")]
    pub cdb64_shard_dir: String,
    #[serde(default)]
    pub cdb64_watch: bool,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub rebroadcast: RebroadcastConfig,
    #[serde(default)]
    pub resolution_cache: ResolutionCacheConfig,
    #[serde(default = "default_attribute_cache_capacity")]
    pub attribute_cache_capacity: usize,
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_cdb64_shard_dir() -> String {
    "./data/root-tx-index".to_string()
}

fn default_attribute_cache_capacity() -> usize {
    10_000
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
pub fn test_config() -> AppConfig {
    AppConfig {
        data_dir: "/tmp/gateway-core-test".to_string(),
        storage: StorageKind::Memory,
        cdb64_shard_dir: "/tmp/gateway-core-test/root-tx-index".to_string(),
        cdb64_watch: false,
        rate_limiter: RateLimiterConfig::default(),
        rebroadcast: RebroadcastConfig::default(),
        resolution_cache: ResolutionCacheConfig::default(),
        attribute_cache_capacity: default_attribute_cache_capacity(),
        redis_url: None,
    }
}
