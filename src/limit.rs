//! Per-endpoint concurrency limiting.
//!
//! Every endpoint URL owns a shared counter in Redis acting as a counting
//! semaphore across all gateway processes. The maximum size comes from an
//! access-limit service answering `<url> <maxsize>` lines; `-1` means
//! unlimited, in which case the pool never touches shared storage.

use crate::error::FederatorError;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const KEY_PREFIX: &str = "request-slot:";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_ALIMIT: i64 = -1;

/// Extract the service token from an FDSN endpoint URL
/// (`.../fdsnws/<service>/1/query`).
fn service_from_fdsnws_url(url: &str) -> Result<String, FederatorError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| FederatorError::Internal(format!("invalid endpoint url {:?}: {}", url, e)))?;
    let segments: Vec<&str> = parsed.path().split('/').collect();
    // Expect ["", prefix, service, version, method].
    if segments.len() != 5 {
        return Err(FederatorError::Internal(format!(
            "invalid endpoint url: {:?}",
            url
        )));
    }
    Ok(segments[2].to_string())
}

/// Redis-backed counting semaphore for one endpoint URL.
pub struct RequestSlotPool {
    client: redis::Client,
    url: String,
    key: String,
    maxsize: i64,
    /// Slots held by this process. Releasing past zero is a code defect.
    held: AtomicI64,
}

impl RequestSlotPool {
    async fn init(client: redis::Client, url: &str, maxsize: i64) -> Result<Self, FederatorError> {
        let key = format!("{}{}", KEY_PREFIX, url);
        if maxsize > -1 {
            let mut conn = client.get_multiplexed_async_connection().await?;
            // First-use initialization; never reset a live counter.
            let _: bool = conn.set_nx(&key, 0i64).await?;
        }
        Ok(Self {
            client,
            url: url.to_string(),
            key,
            maxsize,
            held: AtomicI64::new(0),
        })
    }

    pub fn maxsize(&self) -> i64 {
        self.maxsize
    }

    /// Try to take a slot, polling until `timeout` elapses. Returns `false`
    /// on timeout.
    pub async fn acquire(&self, timeout: Duration) -> Result<bool, FederatorError> {
        if self.maxsize == -1 {
            self.held.fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        loop {
            if self.try_increment(&mut conn).await? {
                self.held.fetch_add(1, Ordering::SeqCst);
                debug!("limit: acquired slot, url={}", self.url);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(
                    "limit: no slots available, discarding connection, url={}",
                    self.url
                );
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Watched check-and-increment: read the counter, compare against
    /// `maxsize`, write back. A concurrent change to the key aborts the
    /// transaction and the attempt counts as "no slot".
    async fn try_increment(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<bool, FederatorError> {
        redis::cmd("WATCH")
            .arg(&self.key)
            .query_async::<()>(conn)
            .await?;
        let current: i64 = conn.get::<_, Option<i64>>(&self.key).await?.unwrap_or(0);

        if current >= self.maxsize {
            redis::cmd("UNWATCH").query_async::<()>(conn).await?;
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(&self.key, current + 1);
        let res: Option<(String,)> = pipe.query_async(conn).await?;
        Ok(res.is_some())
    }

    /// Give a slot back. Panics when this process holds none — that is a
    /// code defect, not a runtime condition.
    pub async fn release(&self) -> Result<(), FederatorError> {
        let previously_held = self.held.fetch_sub(1, Ordering::SeqCst);
        assert!(
            previously_held > 0,
            "request slot released without acquire, url={}",
            self.url
        );

        if self.maxsize == -1 {
            return Ok(());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.decr(&self.key, 1i64).await?;
        Ok(())
    }
}

/// Lazily constructed pools, one per endpoint URL.
pub struct PoolManager {
    client: redis::Client,
    http: reqwest::Client,
    alimit_url: Option<String>,
    pools: DashMap<String, Arc<RequestSlotPool>>,
}

impl PoolManager {
    pub fn new(client: redis::Client, http: reqwest::Client, alimit_url: Option<String>) -> Self {
        Self {
            client,
            http,
            alimit_url,
            pools: DashMap::new(),
        }
    }

    /// Pool for `url`, creating and sizing it on first use.
    pub async fn pool_for(&self, url: &str) -> Result<Arc<RequestSlotPool>, FederatorError> {
        if let Some(pool) = self.pools.get(url) {
            return Ok(pool.value().clone());
        }

        let maxsize = self.fetch_alimit(url).await;
        let pool = Arc::new(RequestSlotPool::init(self.client.clone(), url, maxsize).await?);
        // A concurrent creator may have won the race; keep the stored one.
        Ok(self
            .pools
            .entry(url.to_string())
            .or_insert(pool)
            .value()
            .clone())
    }

    /// Ask the access-limit service for the slot cap of `url`. Any failure,
    /// including a missing entry for the URL, falls back to the default
    /// (unlimited) with a warning.
    async fn fetch_alimit(&self, url: &str) -> i64 {
        let alimit_url = match &self.alimit_url {
            Some(u) => u,
            None => return DEFAULT_ALIMIT,
        };

        let service = match service_from_fdsnws_url(url) {
            Ok(s) => s,
            Err(e) => {
                warn!("limit: {}", e);
                return DEFAULT_ALIMIT;
            }
        };

        let resp = match self
            .http
            .get(alimit_url)
            .query(&[("service", service.as_str())])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("limit: access limit service unreachable: {}", e);
                return DEFAULT_ALIMIT;
            }
        };

        if !resp.status().is_success() {
            warn!(
                "limit: invalid access limit response, url={}, status={}",
                alimit_url,
                resp.status()
            );
            return DEFAULT_ALIMIT;
        }

        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!("limit: failed to read access limit response: {}", e);
                return DEFAULT_ALIMIT;
            }
        };

        match parse_alimit(&body, url) {
            Some(maxsize) => maxsize,
            None => {
                warn!("limit: missing access limit configuration, url={}", url);
                DEFAULT_ALIMIT
            }
        }
    }
}

/// Find the `<url> <maxsize>` line for `url`. Returns `None` when the URL
/// is absent or its maxsize does not parse.
fn parse_alimit(body: &str, url: &str) -> Option<i64> {
    for line in body.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some(url) {
            return fields.next().and_then(|v| v.parse().ok());
        }
    }
    None
}
