use super::handler::{full_body, BoxBody};
use super::FederatorState;
use hyper::body::Incoming;
use hyper::{Request, Response};

pub async fn handle_admin(
    req: Request<Incoming>,
    state: FederatorState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let (status, body) = if state.redis_ready().await {
                (200, r#"{"status":"ready"}"#)
            } else {
                (503, r#"{"status":"redis unreachable"}"#)
            };
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
