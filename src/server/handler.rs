use crate::context::Context;
use crate::error::FederatorError;
use crate::fdsn::{self, Service};
use crate::params;
use crate::process::{RequestProcessor, ResponseBody};
use crate::server::FederatorState;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use std::time::Instant;
use tracing::{info, warn};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

/// Client POST bodies are selector lists; anything larger is abuse.
const MAX_POST_BODY: usize = 1024 * 1024;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

fn stream_body(rx: futures_channel::mpsc::Receiver<std::io::Result<Bytes>>) -> BoxBody {
    BodyExt::boxed(StreamBody::new(rx.map(|chunk| chunk.map(Frame::data))))
}

fn error_response(status: StatusCode, detail: &str, request_url: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", fdsn::MIMETYPE_TEXT)
        .body(full_body(fdsn::error_document(status, detail, request_url)))
        .expect("static response")
}

fn nodata_response(nodata: u16, request_url: &str) -> Response<BoxBody> {
    if nodata == 404 {
        return error_response(
            StatusCode::NOT_FOUND,
            "no data available for the selection",
            request_url,
        );
    }
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .expect("static response")
}

/// Match `/fdsnws/station/1/query`-style paths onto a service family and
/// method token.
fn match_path(path: &str) -> Option<(Service, &str)> {
    for service in [Service::Station, Service::Dataselect, Service::WfCatalog] {
        if let Some(rest) = path.strip_prefix(service.path()) {
            if let Some(token) = rest.strip_prefix('/') {
                return Some((service, token));
            }
        }
    }
    None
}

fn request_url(req: &Request<Incoming>) -> String {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{}{}", host, path_and_query)
}

/// Entry point for every client request.
pub async fn handle_request(
    req: Request<Incoming>,
    state: FederatorState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let url = request_url(&req);
    let path = req.uri().path().to_string();

    let (service, token) = match match_path(&path) {
        Some(found) => found,
        None => return Ok(error_response(StatusCode::NOT_FOUND, "no such resource", &url)),
    };

    match token {
        fdsn::VERSION_METHOD => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", fdsn::MIMETYPE_TEXT)
            .body(full_body(format!("{}\n", fdsn::VERSION)))
            .expect("static response")),

        fdsn::WADL_METHOD => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", fdsn::MIMETYPE_XML)
            .body(full_body(fdsn::wadl_document(service)))
            .expect("static response")),

        fdsn::QUERY_METHOD => Ok(handle_query(req, state, service, url).await),

        _ => Ok(error_response(StatusCode::NOT_FOUND, "no such resource", &url)),
    }
}

async fn handle_query(
    req: Request<Incoming>,
    state: FederatorState,
    service: Service,
    url: String,
) -> Response<BoxBody> {
    let started = Instant::now();
    let ctx = Context::root();
    let method = req.method().clone();

    let post = if method == Method::GET {
        false
    } else if method == Method::POST {
        true
    } else {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header("allow", "GET, POST")
            .body(empty_body())
            .expect("static response");
    };

    let parsed = if post {
        let body = match Limited::new(req.into_body(), MAX_POST_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => {
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large", &url)
            }
        };
        match std::str::from_utf8(&body) {
            Ok(text) => params::parse_post(service, text),
            Err(_) => Err(FederatorError::ClientInput(
                "request body is not valid UTF-8".to_string(),
            )),
        }
    } else {
        params::parse_get(service, req.uri().query().unwrap_or(""))
    };

    let parsed = match parsed {
        Ok(p) => p,
        Err(e) => {
            let response = error_response(StatusCode::BAD_REQUEST, &e.to_string(), &url);
            log_access(&ctx, service, &method, &url, response.status(), started);
            return response;
        }
    };

    metrics::gauge!(
        "federator_requests_in_flight",
        "service" => service.name(),
    )
    .increment(1.0);

    let processor = RequestProcessor::create(service, parsed.format());
    let result = processor.process(&state.engine, &ctx, &parsed, post).await;

    metrics::gauge!(
        "federator_requests_in_flight",
        "service" => service.name(),
    )
    .decrement(1.0);

    let response = match result {
        Ok(output) => {
            let body = match output.body {
                ResponseBody::Full(bytes) => full_body(bytes),
                ResponseBody::Stream(rx) => stream_body(rx),
            };
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", output.mimetype)
                .body(body)
                .expect("static response")
        }
        Err(FederatorError::NoData) => nodata_response(parsed.nodata, &url),
        Err(e @ FederatorError::ClientInput(_)) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string(), &url)
        }
        Err(FederatorError::Cancelled) => {
            info!(ctx = %ctx, "server: request cancelled by client");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "request cancelled", &url)
        }
        Err(e) => {
            warn!(ctx = %ctx, "server: request failed: {}", e);
            error_response(e.http_status(parsed.nodata), &e.to_string(), &url)
        }
    };

    log_access(&ctx, service, &method, &url, response.status(), started);
    response
}

fn log_access(
    ctx: &Context,
    service: Service,
    method: &Method,
    url: &str,
    status: StatusCode,
    started: Instant,
) {
    let mut buf = itoa::Buffer::new();
    metrics::counter!(
        "federator_requests_total",
        "service" => service.name(),
        "method" => method.to_string(),
        "status_code" => buf.format(status.as_u16()).to_owned(),
    )
    .increment(1);
    metrics::histogram!(
        "federator_request_duration_seconds",
        "service" => service.name(),
    )
    .record(started.elapsed().as_secs_f64());

    info!(
        ctx = %ctx,
        service = %service,
        method = %method,
        url = %url,
        status = status.as_u16(),
        latency_ms = %started.elapsed().as_millis(),
        "access"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_path() {
        assert_eq!(
            match_path("/fdsnws/dataselect/1/query"),
            Some((Service::Dataselect, "query"))
        );
        assert_eq!(
            match_path("/fdsnws/station/1/application.wadl"),
            Some((Service::Station, "application.wadl"))
        );
        assert_eq!(
            match_path("/eidaws/wfcatalog/1/version"),
            Some((Service::WfCatalog, "version"))
        );
        assert_eq!(match_path("/fdsnws/event/1/query"), None);
        assert_eq!(match_path("/"), None);
    }
}
