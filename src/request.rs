//! Per-endpoint request execution: one GET or POST against one FDSN
//! endpoint, with slot acquisition, bounded retries, status classification
//! and statistics feedback.

use crate::context::Context;
use crate::limit::PoolManager;
use crate::sncl::{format_timestamp, Route};
use crate::spool::Spool;
use crate::stats::ResponseCodeStats;
use chrono::NaiveDateTime;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Tagged outcome of one endpoint task. Tasks never fail across the pool
/// boundary — every exit path maps onto one of these.
pub enum TaskResult {
    /// Success with a non-empty body.
    Data(Spool),
    /// Success without content (204, or 2xx with zero bytes).
    Empty,
    /// The task never reached the endpoint (slot refused, pool error);
    /// nothing was recorded.
    Skipped,
    /// Permanent client error or exhausted retries; recorded, partial
    /// result omitted.
    Failed(u16),
    /// The request context was cancelled; quiet partial-result status.
    Cancelled,
}

/// Executes endpoint requests for routes handed over by a strategy.
#[derive(Clone)]
pub struct EndpointRequestHandler {
    http: reqwest::Client,
    stats: ResponseCodeStats,
    pools: Arc<PoolManager>,
    timeout: Duration,
    num_retries: u32,
    retry_wait: Duration,
    tmpdir: PathBuf,
}

impl EndpointRequestHandler {
    pub fn new(
        http: reqwest::Client,
        stats: ResponseCodeStats,
        pools: Arc<PoolManager>,
        timeout: Duration,
        num_retries: u32,
        retry_wait: Duration,
        tmpdir: PathBuf,
    ) -> Self {
        Self {
            http,
            stats,
            pools,
            timeout,
            num_retries,
            retry_wait,
            tmpdir,
        }
    }

    /// Issue one endpoint call for `route`.
    ///
    /// Acquires a request slot for the route URL first; on refusal the task
    /// fails soft and records nothing. The slot is released on every exit
    /// path. Bulk routes (more than one stream epoch) are always POSTed.
    pub async fn execute(
        &self,
        ctx: &Context,
        route: &Route,
        method: HttpMethod,
        query_params: &BTreeMap<String, String>,
        default_endtime: NaiveDateTime,
    ) -> TaskResult {
        let pool = match self.pools.pool_for(&route.url).await {
            Ok(p) => p,
            Err(e) => {
                warn!(ctx = %ctx, "request: slot pool unavailable, url={}: {}", route.url, e);
                return TaskResult::Skipped;
            }
        };

        match pool.acquire(self.timeout).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::counter!(
                    "federator_capacity_refused_total",
                    "url" => route.url.clone(),
                )
                .increment(1);
                return TaskResult::Skipped;
            }
            Err(e) => {
                warn!(ctx = %ctx, "request: slot acquire failed, url={}: {}", route.url, e);
                return TaskResult::Skipped;
            }
        }

        let result = self
            .fetch(ctx, route, method, query_params, default_endtime)
            .await;

        if let Err(e) = pool.release().await {
            warn!(ctx = %ctx, "request: slot release failed, url={}: {}", route.url, e);
        }

        result
    }

    async fn fetch(
        &self,
        ctx: &Context,
        route: &Route,
        method: HttpMethod,
        query_params: &BTreeMap<String, String>,
        default_endtime: NaiveDateTime,
    ) -> TaskResult {
        // Bulk selectors only fit a POST body.
        let method = if route.streams.len() > 1 {
            HttpMethod::Post
        } else {
            method
        };

        let mut attempt: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return TaskResult::Cancelled;
            }

            let started = Instant::now();
            let request = self.build_request(route, method, query_params, default_endtime);
            let outcome = self.attempt(ctx, route, request).await;

            metrics::histogram!(
                "federator_endpoint_request_duration_seconds",
                "url" => route.url.clone(),
            )
            .record(started.elapsed().as_secs_f64());

            match outcome {
                Attempt::Done(code, result) => {
                    self.record(ctx, &route.url, code).await;
                    let mut buf = itoa::Buffer::new();
                    metrics::counter!(
                        "federator_endpoint_requests_total",
                        "url" => route.url.clone(),
                        "status_code" => buf.format(code).to_owned(),
                    )
                    .increment(1);
                    return result;
                }
                Attempt::Transient(code) => {
                    // Transient attempts count against the endpoint's
                    // budget too, not only the terminal one.
                    self.record(ctx, &route.url, code).await;
                    let mut buf = itoa::Buffer::new();
                    metrics::counter!(
                        "federator_endpoint_requests_total",
                        "url" => route.url.clone(),
                        "status_code" => buf.format(code).to_owned(),
                    )
                    .increment(1);
                    if attempt < self.num_retries {
                        attempt += 1;
                        debug!(
                            ctx = %ctx,
                            "request: transient failure {}, retrying, url={}, attempt={}/{}",
                            code, route.url, attempt, self.num_retries
                        );
                        metrics::counter!(
                            "federator_endpoint_retries_total",
                            "url" => route.url.clone(),
                        )
                        .increment(1);
                        tokio::time::sleep(self.retry_wait).await;
                        continue;
                    }
                    return TaskResult::Failed(code);
                }
                Attempt::Cancelled => return TaskResult::Cancelled,
            }
        }
    }

    fn build_request(
        &self,
        route: &Route,
        method: HttpMethod,
        query_params: &BTreeMap<String, String>,
        default_endtime: NaiveDateTime,
    ) -> reqwest::RequestBuilder {
        match method {
            HttpMethod::Get => {
                let epoch = &route.streams[0];
                let mut query: Vec<(&str, String)> = query_params
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.clone()))
                    .collect();
                query.push(("network", epoch.stream.network.clone()));
                query.push(("station", epoch.stream.station.clone()));
                query.push(("location", epoch.stream.location_or_dashes().to_string()));
                query.push(("channel", epoch.stream.channel.clone()));
                query.push(("starttime", format_timestamp(epoch.starttime)));
                // Open epochs stay open on GET to keep upstream caches warm.
                if let Some(end) = epoch.endtime {
                    query.push(("endtime", format_timestamp(end)));
                }
                self.http.get(&route.url).query(&query)
            }
            HttpMethod::Post => {
                let mut body = String::new();
                for (key, value) in query_params {
                    body.push_str(key);
                    body.push('=');
                    body.push_str(value);
                    body.push('\n');
                }
                for epoch in &route.streams {
                    body.push_str(&epoch.to_postline(Some(default_endtime)));
                    body.push('\n');
                }
                self.http
                    .post(&route.url)
                    .header("Content-Type", "text/plain")
                    .body(body)
            }
        }
    }

    /// One attempt: send, classify, and stream a success body to a spool.
    async fn attempt(
        &self,
        ctx: &Context,
        route: &Route,
        request: reqwest::RequestBuilder,
    ) -> Attempt {
        let resp = match request.timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(ctx = %ctx, "request: network error, url={}: {}", route.url, e);
                // No status line to record; network errors count against
                // the budget as 503.
                return Attempt::Transient(503);
            }
        };

        let code = resp.status().as_u16();
        match code {
            204 => Attempt::Done(204, TaskResult::Empty),
            200..=299 => match self.copy_body(ctx, resp).await {
                BodyCopy::Complete(spool) if spool.is_empty() => {
                    Attempt::Done(code, TaskResult::Empty)
                }
                BodyCopy::Complete(spool) => Attempt::Done(code, TaskResult::Data(spool)),
                BodyCopy::Interrupted => Attempt::Transient(503),
                BodyCopy::Cancelled => Attempt::Cancelled,
            },
            400 | 404 | 413 => {
                debug!(ctx = %ctx, "request: permanent failure {}, url={}", code, route.url);
                Attempt::Done(code, TaskResult::Failed(code))
            }
            500..=599 => Attempt::Transient(code),
            _ => {
                debug!(ctx = %ctx, "request: unexpected status {}, url={}", code, route.url);
                Attempt::Done(code, TaskResult::Failed(code))
            }
        }
    }

    async fn copy_body(&self, ctx: &Context, resp: reqwest::Response) -> BodyCopy {
        let mut spool = Spool::new(self.tmpdir.clone());
        let mut stream = resp.bytes_stream();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return BodyCopy::Cancelled,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = spool.write(&bytes).await {
                            warn!(ctx = %ctx, "request: spool write failed: {}", e);
                            return BodyCopy::Interrupted;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(ctx = %ctx, "request: body read failed: {}", e);
                        return BodyCopy::Interrupted;
                    }
                    None => return BodyCopy::Complete(spool),
                },
            }
        }
    }

    /// Append the terminal status to the endpoint's series and prune
    /// expired members. Statistics failures never fail the task.
    async fn record(&self, ctx: &Context, url: &str, code: u16) {
        if let Err(e) = self.stats.add(url, code).await {
            warn!(ctx = %ctx, "request: stats append failed, url={}: {}", url, e);
            return;
        }
        if let Err(e) = self.stats.gc(url).await {
            warn!(ctx = %ctx, "request: stats gc failed, url={}: {}", url, e);
        }
    }
}

enum Attempt {
    /// Terminal: record `code` and return the result.
    Done(u16, TaskResult),
    /// Retry-eligible failure with the code to record if retries run out.
    Transient(u16),
    Cancelled,
}

enum BodyCopy {
    Complete(Spool),
    Interrupted,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sncl::StreamEpoch;

    fn handler() -> EndpointRequestHandler {
        EndpointRequestHandler::new(
            reqwest::Client::new(),
            ResponseCodeStats::new(
                redis::Client::open("redis://127.0.0.1:1/").unwrap(),
                3600,
                100,
            ),
            Arc::new(PoolManager::new(
                redis::Client::open("redis://127.0.0.1:1/").unwrap(),
                reqwest::Client::new(),
                None,
            )),
            Duration::from_secs(5),
            0,
            Duration::from_secs(0),
            std::env::temp_dir(),
        )
    }

    fn epoch(line: &str) -> StreamEpoch {
        StreamEpoch::from_postline(line, None).unwrap()
    }

    #[test]
    fn test_bulk_post_body_shape() {
        let h = handler();
        let route = Route::new(
            "http://ep/fdsnws/dataselect/1/query",
            vec![
                epoch("GR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00"),
                epoch("GR FUR -- BHZ 2020-01-01T00:00:00"),
            ],
        );
        let mut params = BTreeMap::new();
        params.insert("quality".to_string(), "B".to_string());
        let now = crate::sncl::parse_timestamp("2021-01-01T00:00:00").unwrap();

        let req = h
            .build_request(&route, HttpMethod::Post, &params, now)
            .build()
            .unwrap();
        let body = std::str::from_utf8(req.body().unwrap().as_bytes().unwrap()).unwrap();

        assert_eq!(
            body,
            "quality=B\n\
             GR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n\
             GR FUR -- BHZ 2020-01-01T00:00:00 2021-01-01T00:00:00\n"
        );
    }

    #[test]
    fn test_get_request_keeps_open_end() {
        let h = handler();
        let route = Route::new(
            "http://ep/fdsnws/dataselect/1/query",
            vec![epoch("GR WET -- BHZ 2020-01-01T00:00:00")],
        );
        let now = crate::sncl::parse_timestamp("2021-01-01T00:00:00").unwrap();

        let req = h
            .build_request(&route, HttpMethod::Get, &BTreeMap::new(), now)
            .build()
            .unwrap();
        let url = req.url().as_str();
        assert!(url.contains("starttime=2020-01-01T00%3A00%3A00"));
        assert!(!url.contains("endtime"));
        assert!(url.contains("location=--"));
    }
}
