//! Response-code statistics shared across the deployment.
//!
//! Each endpoint URL owns a bounded, TTL'd time series of the HTTP status
//! codes the gateway observed for it, stored as a Redis sorted set scored by
//! unix timestamp. The error ratio over the live window drives the
//! client-side retry budget.

use crate::error::FederatorError;
use rand::Rng;
use redis::AsyncCommands;
use std::time::{SystemTime, UNIX_EPOCH};

/// Status codes counted as errors by the retry budget.
const ERROR_CODES: &[u16] = &[500, 503];

const KEY_PREFIX: &str = "stats:response-codes";

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

/// Serialize a member as `code:score:nonce`. The random tail permits the
/// same code at the same instant without collapsing set members.
fn serialize_member(code: u16, score: f64) -> String {
    let nonce: u64 = rand::thread_rng().gen();
    format!("{}:{}:{:016x}", code, score, nonce)
}

fn deserialize_member(member: &str) -> Option<u16> {
    member.split(':').next()?.parse().ok()
}

fn error_ratio_of(codes: &[u16]) -> f64 {
    if codes.is_empty() {
        return 0.0;
    }
    let errors = codes.iter().filter(|c| ERROR_CODES.contains(c)).count();
    errors as f64 / codes.len() as f64
}

/// A single endpoint's response-code time series.
pub struct ResponseCodeTimeSeries {
    client: redis::Client,
    key: String,
    ttl: u64,
    window_size: u64,
}

impl ResponseCodeTimeSeries {
    pub fn new(client: redis::Client, key: String, ttl: u64, window_size: u64) -> Self {
        Self {
            client,
            key,
            ttl,
            window_size,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record `(code, now)` and evict the oldest member once the window is
    /// exceeded. Add and evict run in one watched transaction so concurrent
    /// appenders cannot grow the set past `window_size`.
    pub async fn append(&self, code: u16) -> Result<(), FederatorError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        loop {
            redis::cmd("WATCH")
                .arg(&self.key)
                .query_async::<()>(&mut conn)
                .await?;
            let count: u64 = conn.zcount(&self.key, "-inf", "+inf").await?;

            let score = unix_now();
            let member = serialize_member(code, score);

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.zadd(&self.key, member, score);
            if count + 1 > self.window_size {
                pipe.zremrangebyrank(&self.key, 0, 0).ignore();
            }

            // A nil EXEC reply means the watched key changed underneath us.
            let res: Option<(i64,)> = pipe.query_async(&mut conn).await?;
            if res.is_some() {
                return Ok(());
            }
        }
    }

    /// Non-expired members, newest first.
    pub async fn members(&self) -> Result<Vec<(u16, f64)>, FederatorError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let min = unix_now() - self.ttl as f64;
        let items: Vec<(String, f64)> = conn
            .zrevrangebyscore_withscores(&self.key, "+inf", min)
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|(member, score)| deserialize_member(&member).map(|c| (c, score)))
            .collect())
    }

    pub async fn len(&self) -> Result<u64, FederatorError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.zcount(&self.key, "-inf", "+inf").await?)
    }

    /// Share of non-expired members whose code is in the error set.
    /// `0` when the series is empty.
    pub async fn error_ratio(&self) -> Result<f64, FederatorError> {
        let codes: Vec<u16> = self.members().await?.into_iter().map(|(c, _)| c).collect();
        Ok(error_ratio_of(&codes))
    }

    /// Drop members older than the TTL.
    pub async fn gc(&self) -> Result<(), FederatorError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let threshold = unix_now() - self.ttl as f64;
        let _: i64 = conn.zrembyscore(&self.key, "-inf", threshold).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), FederatorError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.del(&self.key).await?;
        Ok(())
    }
}

/// Registry of per-endpoint time series, keyed
/// `stats:response-codes:<path>:<netloc>`.
#[derive(Clone)]
pub struct ResponseCodeStats {
    client: redis::Client,
    ttl: u64,
    window_size: u64,
}

impl ResponseCodeStats {
    pub fn new(client: redis::Client, ttl: u64, window_size: u64) -> Self {
        Self {
            client,
            ttl,
            window_size,
        }
    }

    pub fn key_for_url(url: &str) -> Result<String, FederatorError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| FederatorError::Internal(format!("invalid endpoint url {:?}: {}", url, e)))?;
        let host = parsed.host_str().unwrap_or_default();
        let netloc = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok(format!("{}:{}:{}", KEY_PREFIX, parsed.path(), netloc))
    }

    pub fn series(&self, url: &str) -> Result<ResponseCodeTimeSeries, FederatorError> {
        Ok(ResponseCodeTimeSeries::new(
            self.client.clone(),
            Self::key_for_url(url)?,
            self.ttl,
            self.window_size,
        ))
    }

    pub async fn add(&self, url: &str, code: u16) -> Result<(), FederatorError> {
        self.series(url)?.append(code).await
    }

    /// Error ratio in `[0, 1]` for the endpoint's live window.
    pub async fn error_ratio(&self, url: &str) -> Result<f64, FederatorError> {
        self.series(url)?.error_ratio().await
    }

    pub async fn gc(&self, url: &str) -> Result<(), FederatorError> {
        self.series(url)?.gc().await
    }

    pub async fn clear(&self, url: &str) -> Result<(), FederatorError> {
        self.series(url)?.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_roundtrip() {
        let member = serialize_member(503, 1_600_000_000.25);
        assert_eq!(deserialize_member(&member), Some(503));
    }

    #[test]
    fn test_members_with_same_code_and_score_differ() {
        let a = serialize_member(200, 1_600_000_000.0);
        let b = serialize_member(200, 1_600_000_000.0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_error_ratio() {
        assert_eq!(error_ratio_of(&[]), 0.0);
        assert_eq!(error_ratio_of(&[200, 200]), 0.0);
        assert_eq!(error_ratio_of(&[500, 503]), 1.0);
        let ratio = error_ratio_of(&[503, 503, 503, 503, 503, 503, 503, 503, 200, 200]);
        assert!((ratio - 0.8).abs() < f64::EPSILON);
        // 404 is a client error, not a budget error.
        assert_eq!(error_ratio_of(&[404, 404]), 0.0);
    }

    #[test]
    fn test_key_from_url() {
        let key =
            ResponseCodeStats::key_for_url("http://ep.example.org/fdsnws/dataselect/1/query")
                .unwrap();
        assert_eq!(
            key,
            "stats:response-codes:/fdsnws/dataselect/1/query:ep.example.org"
        );

        let key = ResponseCodeStats::key_for_url("http://ep:8080/fdsnws/station/1/query").unwrap();
        assert_eq!(key, "stats:response-codes:/fdsnws/station/1/query:ep:8080");
    }
}
