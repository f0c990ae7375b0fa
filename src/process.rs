//! Request processing: cache lookup, routing, dispatch and combining.
//!
//! One [`Engine`] is built at startup and handed to the web layer; a
//! [`RequestProcessor`] is created per client request and drives the whole
//! pipeline, producing either a full body (buffered formats, cache hits) or
//! a chunk stream.

use crate::cache::{fingerprint, Cache};
use crate::combine::{Combiner, TextHeaderStripper};
use crate::context::Context;
use crate::error::FederatorError;
use crate::fdsn::Service;
use crate::params::ParsedRequest;
use crate::request::{EndpointRequestHandler, HttpMethod, TaskResult};
use crate::routing::RoutingClient;
use crate::sncl::Route;
use crate::spool::Spool;
use crate::stats::ResponseCodeStats;
use crate::strategy::{filter_by_retry_budget, RequestStrategy, WorkItem};
use crate::worker::{TaskHandle, TaskPool};
use bytes::Bytes;
use chrono::NaiveDateTime;
use futures_channel::{mpsc, oneshot};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the processing pipeline needs, built once at startup.
#[derive(Clone)]
pub struct Engine {
    pub routing: RoutingClient,
    pub stats: ResponseCodeStats,
    pub handler: EndpointRequestHandler,
    pub pool: TaskPool,
    pub cache: Arc<Cache>,
    pub retry_budget_client: f64,
    pub tmpdir: PathBuf,
}

pub struct ProcessorResponse {
    pub mimetype: &'static str,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Full(Bytes),
    Stream(mpsc::Receiver<std::io::Result<Bytes>>),
}

enum Verdict {
    Data,
    NoData,
}

pub struct RequestProcessor {
    service: Service,
    strategy: RequestStrategy,
    combiner: Combiner,
    mimetype: &'static str,
}

impl RequestProcessor {
    /// Select strategy, combiner and MIME type for a service family.
    pub fn create(service: Service, format: Option<&str>) -> Self {
        let (strategy, combiner) = match service {
            Service::Dataselect => (RequestStrategy::Granular, Combiner::Raw),
            Service::Station => {
                if format == Some("text") {
                    (RequestStrategy::NetworkBulk, Combiner::Text)
                } else {
                    (RequestStrategy::NetworkCombining, Combiner::StationXml)
                }
            }
            Service::WfCatalog => (RequestStrategy::AdaptiveNetworkBulk, Combiner::JsonArray),
        };
        Self {
            service,
            strategy,
            combiner,
            mimetype: service.mimetype(format),
        }
    }

    pub fn strategy(&self) -> RequestStrategy {
        self.strategy
    }

    /// Run the pipeline for one client request.
    pub async fn process(
        &self,
        engine: &Engine,
        ctx: &Context,
        parsed: &ParsedRequest,
        post: bool,
    ) -> Result<ProcessorResponse, FederatorError> {
        let key = fingerprint(&parsed.params, &parsed.stream_epochs);

        if let Some(body) = engine.cache.get(&key).await {
            metrics::counter!("federator_cache_total", "result" => "hit").increment(1);
            info!(ctx = %ctx, "process: serving from cache, fingerprint={}", key);
            return Ok(ProcessorResponse {
                mimetype: self.mimetype,
                body: ResponseBody::Full(body),
            });
        }
        metrics::counter!("federator_cache_total", "result" => "miss").increment(1);

        let default_endtime = chrono::Utc::now().naive_utc();

        let mut table = engine
            .routing
            .resolve(ctx, self.service, &parsed.stream_epochs, post, default_endtime)
            .await?;

        filter_by_retry_budget(&mut table, &engine.stats, engine.retry_budget_client).await;
        if table.is_empty() {
            warn!(ctx = %ctx, "process: all routes dropped by retry budget");
            return Err(FederatorError::NoData);
        }

        let method = if post { HttpMethod::Post } else { HttpMethod::Get };
        let items = self.strategy.route(&table, method);
        debug!(ctx = %ctx, "process: dispatching {} tasks", items.len());

        let handles = self.dispatch(engine, ctx, items, &parsed.params, default_endtime);

        if self.combiner.is_streaming() {
            self.stream_response(engine, ctx, handles, key).await
        } else {
            self.buffered_response(engine, ctx, handles, key).await
        }
    }

    fn dispatch(
        &self,
        engine: &Engine,
        ctx: &Context,
        items: Vec<WorkItem>,
        params: &BTreeMap<String, String>,
        default_endtime: NaiveDateTime,
    ) -> Vec<TaskHandle<TaskResult>> {
        items
            .into_iter()
            .map(|item| {
                let task_ctx = ctx.child();
                let handler = engine.handler.clone();
                let params = params.clone();
                match item {
                    WorkItem::Single { route, method } => engine.pool.spawn(async move {
                        handler
                            .execute(&task_ctx, &route, method, &params, default_endtime)
                            .await
                    }),
                    WorkItem::Combining {
                        network,
                        routes,
                        method,
                    } => {
                        let combiner = self.combiner;
                        let tmpdir = engine.tmpdir.clone();
                        engine.pool.spawn(async move {
                            combining_task(
                                task_ctx,
                                handler,
                                combiner,
                                network,
                                routes,
                                method,
                                params,
                                default_endtime,
                                tmpdir,
                            )
                            .await
                        })
                    }
                }
            })
            .collect()
    }

    /// Buffered formats: await every task, merge, commit to cache, answer
    /// with the full body.
    async fn buffered_response(
        &self,
        engine: &Engine,
        ctx: &Context,
        handles: Vec<TaskHandle<TaskResult>>,
        key: String,
    ) -> Result<ProcessorResponse, FederatorError> {
        let mut parts = Vec::new();
        for handle in handles {
            let result = handle.join().await.unwrap_or_else(|e| {
                warn!(ctx = %ctx, "process: task failed to join: {}", e);
                TaskResult::Failed(500)
            });
            match result {
                TaskResult::Data(spool) => match spool.into_bytes().await {
                    Ok(bytes) => parts.push(bytes),
                    Err(e) => warn!(ctx = %ctx, "process: partial read failed: {}", e),
                },
                TaskResult::Cancelled => return Err(FederatorError::Cancelled),
                TaskResult::Empty | TaskResult::Skipped | TaskResult::Failed(_) => {}
            }
        }

        if parts.is_empty() {
            return Err(FederatorError::NoData);
        }

        let body = self.combiner.combine(parts)?;
        if body.is_empty() {
            return Err(FederatorError::NoData);
        }

        engine
            .cache
            .set(&key, body.clone(), engine.cache.default_ttl())
            .await;

        Ok(ProcessorResponse {
            mimetype: self.mimetype,
            body: ResponseBody::Full(body),
        })
    }

    /// Streaming formats: forward partials in submission order as they
    /// complete. The verdict (data vs. no data) is decided by the first
    /// non-empty partial, before any byte is committed.
    async fn stream_response(
        &self,
        engine: &Engine,
        ctx: &Context,
        handles: Vec<TaskHandle<TaskResult>>,
        key: String,
    ) -> Result<ProcessorResponse, FederatorError> {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        let (verdict_tx, verdict_rx) = oneshot::channel::<Verdict>();

        let driver_ctx = ctx.clone();
        let combiner = self.combiner;
        let cache = engine.cache.clone();
        let ttl = engine.cache.default_ttl();
        tokio::spawn(async move {
            stream_driver(driver_ctx, handles, combiner, cache, key, ttl, tx, verdict_tx).await;
        });

        match verdict_rx.await {
            Ok(Verdict::Data) => Ok(ProcessorResponse {
                mimetype: self.mimetype,
                body: ResponseBody::Stream(rx),
            }),
            Ok(Verdict::NoData) => Err(FederatorError::NoData),
            // The driver only drops the verdict when the request context
            // was cancelled before the first partial arrived.
            Err(_) => Err(FederatorError::Cancelled),
        }
    }
}

/// A localized granular sub-run for one network: issue the endpoint calls
/// sequentially, merge the partials, and hand back a single part.
#[allow(clippy::too_many_arguments)]
async fn combining_task(
    ctx: Context,
    handler: EndpointRequestHandler,
    combiner: Combiner,
    network: String,
    routes: Vec<Route>,
    method: HttpMethod,
    params: BTreeMap<String, String>,
    default_endtime: NaiveDateTime,
    tmpdir: PathBuf,
) -> TaskResult {
    debug!(ctx = %ctx, "combining: requesting network={}, routes={}", network, routes.len());

    let mut parts = Vec::new();
    for route in &routes {
        if ctx.is_cancelled() {
            return TaskResult::Cancelled;
        }
        match handler
            .execute(&ctx, route, method, &params, default_endtime)
            .await
        {
            TaskResult::Data(spool) => match spool.into_bytes().await {
                Ok(bytes) => parts.push(bytes),
                Err(e) => warn!(ctx = %ctx, "combining: partial read failed: {}", e),
            },
            TaskResult::Cancelled => return TaskResult::Cancelled,
            TaskResult::Empty | TaskResult::Skipped | TaskResult::Failed(_) => {}
        }
    }

    if parts.is_empty() {
        return TaskResult::Empty;
    }

    match combiner.combine(parts) {
        Ok(bytes) if bytes.is_empty() => TaskResult::Empty,
        Ok(bytes) => {
            let mut spool = Spool::new(tmpdir);
            match spool.write(&bytes).await {
                Ok(()) => TaskResult::Data(spool),
                Err(e) => {
                    warn!(ctx = %ctx, "combining: spool write failed, network={}: {}", network, e);
                    TaskResult::Failed(500)
                }
            }
        }
        Err(FederatorError::NoData) => TaskResult::Empty,
        Err(e) => {
            warn!(ctx = %ctx, "combining: merge failed, network={}: {}", network, e);
            TaskResult::Failed(500)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_driver(
    ctx: Context,
    handles: Vec<TaskHandle<TaskResult>>,
    combiner: Combiner,
    cache: Arc<Cache>,
    key: String,
    ttl: u64,
    mut tx: mpsc::Sender<std::io::Result<Bytes>>,
    verdict_tx: oneshot::Sender<Verdict>,
) {
    let mut verdict_tx = Some(verdict_tx);
    let mut cache_buf: Option<Vec<u8>> = cache.is_enabled().then(Vec::new);
    let mut first_part = true;

    for handle in handles {
        let result = handle.join().await.unwrap_or_else(|e| {
            warn!(ctx = %ctx, "process: task failed to join: {}", e);
            TaskResult::Failed(500)
        });

        let spool = match result {
            TaskResult::Data(spool) => spool,
            TaskResult::Cancelled => return,
            TaskResult::Empty | TaskResult::Skipped | TaskResult::Failed(_) => continue,
        };

        let mut stream = match spool.into_stream().await {
            Ok(s) => s,
            Err(e) => {
                warn!(ctx = %ctx, "process: partial read failed: {}", e);
                continue;
            }
        };

        // Text partials after the first drop their header line.
        let mut stripper =
            TextHeaderStripper::new(combiner != Combiner::Text || first_part);

        if first_part {
            first_part = false;
            if let Some(verdict) = verdict_tx.take() {
                if verdict.send(Verdict::Data).is_err() {
                    return;
                }
            }
        }

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => stripper.filter(c),
                Err(e) => {
                    warn!(ctx = %ctx, "process: partial stream failed: {}", e);
                    // Abort the body; the client sees a truncated response.
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            if let Some(buf) = cache_buf.as_mut() {
                buf.extend_from_slice(&chunk);
            }
            if tx.send(Ok(chunk)).await.is_err() {
                // Client disconnected mid-stream: stop the tasks, discard
                // the partial cache buffer.
                info!(ctx = %ctx, "process: client disconnected, cancelling");
                ctx.cancel();
                return;
            }
        }
    }

    if let Some(verdict) = verdict_tx.take() {
        let _ = verdict.send(Verdict::NoData);
        return;
    }

    drop(tx);
    if !ctx.is_cancelled() {
        if let Some(buf) = cache_buf {
            cache.set(&key, Bytes::from(buf), ttl).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_strategy_mapping() {
        let p = RequestProcessor::create(Service::Dataselect, None);
        assert_eq!(p.strategy(), RequestStrategy::Granular);
        assert_eq!(p.combiner, Combiner::Raw);
        assert_eq!(p.mimetype, crate::fdsn::MIMETYPE_MSEED);

        let p = RequestProcessor::create(Service::Station, None);
        assert_eq!(p.strategy(), RequestStrategy::NetworkCombining);
        assert_eq!(p.combiner, Combiner::StationXml);

        let p = RequestProcessor::create(Service::Station, Some("text"));
        assert_eq!(p.strategy(), RequestStrategy::NetworkBulk);
        assert_eq!(p.combiner, Combiner::Text);
        assert_eq!(p.mimetype, crate::fdsn::MIMETYPE_TEXT);

        let p = RequestProcessor::create(Service::WfCatalog, None);
        assert_eq!(p.strategy(), RequestStrategy::AdaptiveNetworkBulk);
        assert_eq!(p.combiner, Combiner::JsonArray);
    }
}
