//! Shared helpers for integration tests: a Redis container, in-process
//! mock HTTP servers, and engine construction.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use seisfed::cache::Cache;
use seisfed::limit::PoolManager;
use seisfed::process::Engine;
use seisfed::request::EndpointRequestHandler;
use seisfed::routing::RoutingClient;
use seisfed::stats::ResponseCodeStats;
use seisfed::worker::TaskPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tokio::net::TcpListener;

/// Start a Redis container and return its URL. The container handle must
/// stay alive for the duration of the test.
pub async fn start_redis() -> (String, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379_u16.tcp())
        .start()
        .await
        .expect("failed to start redis container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(6379).await.expect("get port");
    let url = format!("redis://{}:{}/", host, port);

    // Wait for redis to answer.
    let client = redis::Client::open(url.as_str()).expect("redis url");
    for _ in 0..50 {
        if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
            if redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok()
            {
                return (url, container);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("redis container did not become ready");
}

/// A request as seen by a mock server.
pub struct Received {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: Vec<u8>,
}

/// Spawn an in-process HTTP server; returns its base URL.
pub async fn spawn_server<F>(handler: F) -> String
where
    F: Fn(Received) -> (u16, Vec<u8>) + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_default();
                        let received = Received {
                            method: parts.method.to_string(),
                            path: parts.uri.path().to_string(),
                            query: parts.uri.query().unwrap_or("").to_string(),
                            body: body.to_vec(),
                        };
                        let (status, body) = handler(received);
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, svc)
                    .await;
            });
        }
    });

    format!("http://{}", addr)
}

pub struct EngineOptions {
    pub retry_budget_client: f64,
    pub num_retries: u32,
    pub cache: Cache,
    pub alimit_url: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry_budget_client: 100.0,
            num_retries: 0,
            cache: Cache::null(),
            alimit_url: None,
        }
    }
}

pub fn build_engine(redis_url: &str, routing_url: &str, options: EngineOptions) -> Engine {
    let redis = redis::Client::open(redis_url).expect("redis url");
    let http = reqwest::Client::new();

    let stats = ResponseCodeStats::new(redis.clone(), 3600, 100);
    let pools = Arc::new(PoolManager::new(
        redis.clone(),
        http.clone(),
        options.alimit_url,
    ));
    let handler = EndpointRequestHandler::new(
        http.clone(),
        stats.clone(),
        pools,
        Duration::from_secs(10),
        options.num_retries,
        Duration::from_secs(0),
        std::env::temp_dir(),
    );

    Engine {
        routing: RoutingClient::new(http, routing_url.to_string(), Duration::from_secs(10)),
        stats,
        handler,
        pool: TaskPool::new(4),
        cache: Arc::new(options.cache),
        retry_budget_client: options.retry_budget_client,
        tmpdir: std::env::temp_dir(),
    }
}
