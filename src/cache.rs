//! Response caching.
//!
//! A cached entry is the complete combined body of a finished request,
//! keyed by a short fingerprint of the request's cacheable identity. Two
//! backends share one interface: a null cache (pass-through) and Redis.
//! Cache failures are reported and absorbed — they never fail an in-flight
//! response.

use crate::sncl::StreamEpoch;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use tracing::warn;

/// Query parameters that never contribute to the fingerprint. Part of the
/// public contract: changing this set silently invalidates every deployed
/// cache key.
const EXCLUDED_PARAMS: &[&str] = &["nodata", "service"];

/// Fingerprint of a request's cacheable identity: the 16-character URL-safe
/// base64 prefix of an MD5 digest over the sorted query parameters (minus
/// the exclusion set) and the sorted stream epochs. Stable across
/// permutations of either input.
pub fn fingerprint(query_params: &BTreeMap<String, String>, stream_epochs: &[StreamEpoch]) -> String {
    let mut epochs: Vec<&StreamEpoch> = stream_epochs.iter().collect();
    epochs.sort();

    let mut canonical = String::new();
    for (key, value) in query_params {
        if EXCLUDED_PARAMS.contains(&key.as_str()) {
            continue;
        }
        canonical.push_str(key);
        canonical.push('=');
        canonical.push_str(value);
        canonical.push('&');
    }
    for epoch in epochs {
        canonical.push_str(&epoch.to_postline(None));
        canonical.push('|');
    }
    canonical.retain(|c| !c.is_control());

    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut encoded = URL_SAFE.encode(digest);
    encoded.truncate(16);
    encoded
}

enum Backend {
    Null,
    Redis {
        client: redis::Client,
        key_prefix: String,
    },
}

pub struct Cache {
    backend: Backend,
    default_ttl: u64,
}

impl Cache {
    pub fn null() -> Self {
        Self {
            backend: Backend::Null,
            default_ttl: 0,
        }
    }

    pub fn redis(client: redis::Client, key_prefix: String, default_ttl: u64) -> Self {
        Self {
            backend: Backend::Redis { client, key_prefix },
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Whether responses are worth buffering for a later `set`.
    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, Backend::Null)
    }

    /// Look up a fingerprint. Backend errors log and read as a miss.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match &self.backend {
            Backend::Null => None,
            Backend::Redis { client, key_prefix } => {
                let full_key = format!("{}{}", key_prefix, key);
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("cache: backend unreachable: {}", e);
                        return None;
                    }
                };
                match conn.get::<_, Option<Vec<u8>>>(&full_key).await {
                    Ok(value) => value.map(Bytes::from),
                    Err(e) => {
                        warn!("cache: lookup failed, key={}: {}", full_key, e);
                        None
                    }
                }
            }
        }
    }

    /// Store a completed response body. A TTL of `0` never expires.
    /// Write failures are reported and absorbed.
    pub async fn set(&self, key: &str, value: Bytes, ttl: u64) {
        match &self.backend {
            Backend::Null => {}
            Backend::Redis { client, key_prefix } => {
                let full_key = format!("{}{}", key_prefix, key);
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("cache: backend unreachable: {}", e);
                        return;
                    }
                };
                let result = if ttl == 0 {
                    conn.set::<_, _, ()>(&full_key, value.as_ref()).await
                } else {
                    conn.set_ex::<_, _, ()>(&full_key, value.as_ref(), ttl).await
                };
                if let Err(e) = result {
                    warn!("cache: write failed, key={}: {}", full_key, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sncl::StreamEpoch;

    fn epoch(line: &str) -> StreamEpoch {
        StreamEpoch::from_postline(line, None).unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_stable_across_epoch_permutations() {
        let a = epoch("GR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00");
        let b = epoch("CH DAVOX -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00");
        let p = params(&[("format", "xml"), ("level", "channel")]);

        assert_eq!(
            fingerprint(&p, &[a.clone(), b.clone()]),
            fingerprint(&p, &[b, a])
        );
    }

    #[test]
    fn test_fingerprint_ignores_excluded_params() {
        let e = epoch("GR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00");
        let with_nodata = params(&[("format", "xml"), ("nodata", "404")]);
        let without = params(&[("format", "xml")]);
        let with_other_nodata = params(&[("format", "xml"), ("nodata", "204")]);

        let key = fingerprint(&without, std::slice::from_ref(&e));
        assert_eq!(key, fingerprint(&with_nodata, std::slice::from_ref(&e)));
        assert_eq!(key, fingerprint(&with_other_nodata, std::slice::from_ref(&e)));
    }

    #[test]
    fn test_fingerprint_differs_for_different_selectors() {
        let a = epoch("GR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00");
        let b = epoch("GR WET -- LHZ 2020-01-01T00:00:00 2020-01-02T00:00:00");
        let p = params(&[]);
        assert_ne!(
            fingerprint(&p, std::slice::from_ref(&a)),
            fingerprint(&p, std::slice::from_ref(&b))
        );
    }

    #[test]
    fn test_fingerprint_shape() {
        let e = epoch("GR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00");
        let key = fingerprint(&params(&[]), &[e]);
        assert_eq!(key.len(), 16);
        // URL-safe alphabet only.
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
    }

    #[tokio::test]
    async fn test_null_cache_never_hits() {
        let cache = Cache::null();
        cache.set("abc", Bytes::from("data"), 60).await;
        assert!(cache.get("abc").await.is_none());
    }
}
