use crate::cache::Cache;
use crate::config::{CacheBackendKind, FederatorConfig};
use crate::limit::PoolManager;
use crate::metrics::Metrics;
use crate::process::Engine;
use crate::request::EndpointRequestHandler;
use crate::routing::RoutingClient;
use crate::stats::ResponseCodeStats;
use crate::worker::TaskPool;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Shared gateway state, cheaply cloneable. The web layer holds one; every
/// request borrows the engine from it.
#[derive(Clone)]
pub struct FederatorState {
    pub config: Arc<FederatorConfig>,
    pub engine: Engine,
    pub metrics: Metrics,
    redis: redis::Client,
}

impl FederatorState {
    pub fn new(config: FederatorConfig) -> Result<Self> {
        let redis = redis::Client::open(config.redis.url.as_str())?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let stats = ResponseCodeStats::new(
            redis.clone(),
            config.stats.ttl_secs,
            config.stats.window_size,
        );

        let pools = Arc::new(PoolManager::new(
            redis.clone(),
            http.clone(),
            config.limit.alimit_url.clone(),
        ));

        let handler = EndpointRequestHandler::new(
            http.clone(),
            stats.clone(),
            pools,
            Duration::from_secs(config.endpoint.timeout_secs),
            config.endpoint.num_retries,
            Duration::from_secs(config.endpoint.retry_wait_secs),
            config.tmpdir(),
        );

        let cache = match config.cache.backend {
            CacheBackendKind::Null => Cache::null(),
            CacheBackendKind::Redis => Cache::redis(
                redis.clone(),
                config.cache.key_prefix.clone(),
                config.cache.ttl_secs,
            ),
        };

        let routing = RoutingClient::new(
            http,
            config.routing.url.clone(),
            Duration::from_secs(config.routing.timeout_secs),
        );

        let engine = Engine {
            routing,
            stats,
            handler,
            pool: TaskPool::new(config.pool.max_workers),
            cache: Arc::new(cache),
            retry_budget_client: config.retry_budget_client,
            tmpdir: config.tmpdir(),
        };

        let metrics = Metrics::install();

        Ok(Self {
            config: Arc::new(config),
            engine,
            metrics,
            redis,
        })
    }

    /// Readiness: the shared coordination backend answers a PING.
    pub async fn redis_ready(&self) -> bool {
        match self.redis.get_multiplexed_async_connection().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }
}
