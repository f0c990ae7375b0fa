use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatorConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub limit: LimitConfig,

    /// Per-client retry budget in percent. Endpoints whose recent error
    /// ratio exceeds this are skipped; `100` disables the gate.
    #[serde(default = "default_retry_budget")]
    pub retry_budget_client: f64,

    /// Scratch directory for spooling partial responses. Defaults to the
    /// system temp directory.
    #[serde(default)]
    pub tmpdir: Option<PathBuf>,
}

fn default_retry_budget() -> f64 {
    100.0
}

impl Default for FederatorConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            endpoint: EndpointConfig::default(),
            pool: PoolConfig::default(),
            stats: StatsConfig::default(),
            cache: CacheConfig::default(),
            redis: RedisConfig::default(),
            limit: LimitConfig::default(),
            retry_budget_client: default_retry_budget(),
            tmpdir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Resolver endpoint URL.
    #[serde(default = "default_routing_url")]
    pub url: String,

    #[serde(default = "default_routing_timeout")]
    pub timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            url: default_routing_url(),
            timeout_secs: default_routing_timeout(),
        }
    }
}

fn default_routing_url() -> String {
    "http://localhost:8002/eidaws/routing/1/query".to_string()
}

fn default_routing_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Total deadline for one endpoint call, including body read.
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_num_retries")]
    pub num_retries: u32,

    /// Fixed wait between retry attempts.
    #[serde(default = "default_retry_wait")]
    pub retry_wait_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_endpoint_timeout(),
            num_retries: default_num_retries(),
            retry_wait_secs: default_retry_wait(),
        }
    }
}

fn default_endpoint_timeout() -> u64 {
    600
}

fn default_num_retries() -> u32 {
    2
}

fn default_retry_wait() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker-pool size: concurrent outbound endpoint calls per process.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Members older than this are not observable.
    #[serde(default = "default_stats_ttl")]
    pub ttl_secs: u64,

    /// Maximum members per response-code series.
    #[serde(default = "default_stats_window")]
    pub window_size: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_stats_ttl(),
            window_size: default_stats_window(),
        }
    }
}

fn default_stats_ttl() -> u64 {
    3600
}

fn default_stats_window() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Null,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,

    /// Entry lifetime; `0` never expires.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            ttl_secs: default_cache_ttl(),
            key_prefix: default_cache_prefix(),
        }
    }
}

fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Null
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_prefix() -> String {
    "cache:".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Access-limit service URL answering `<url> <maxsize>` lines.
    /// Absent means every endpoint is unlimited.
    #[serde(default)]
    pub alimit_url: Option<String>,
}
