use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Tag every request with an id, echoed back in `x-request-id`.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// What the logger knows about one failed request.
struct FailedRequest {
    method: Method,
    path: String,
    request_id: String,
    status: StatusCode,
    elapsed_ms: u64,
    source: &'static str,
    chain: Vec<String>,
}

impl FailedRequest {
    fn detail(&self) -> &str {
        self.chain
            .first()
            .map(String::as_str)
            .unwrap_or("no diagnostic available")
    }

    fn log(&self) {
        if self.status.is_server_error() {
            error!(
                target = "docpress::http::response",
                status = self.status.as_u16(),
                method = %self.method,
                path = %self.path,
                elapsed_ms = self.elapsed_ms,
                source = self.source,
                detail = %self.detail(),
                chain = ?self.chain,
                request_id = %self.request_id,
                "request failed"
            );
        } else {
            warn!(
                target = "docpress::http::response",
                status = self.status.as_u16(),
                method = %self.method,
                path = %self.path,
                elapsed_ms = self.elapsed_ms,
                source = self.source,
                detail = %self.detail(),
                request_id = %self.request_id,
                "request rejected"
            );
        }
    }
}

/// Log 4xx/5xx responses together with the `ErrorReport` the handler attached.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return response;
    }

    let (source, chain) = response
        .extensions_mut()
        .remove::<ErrorReport>()
        .map(|report| (report.source, report.messages))
        .unwrap_or(("unknown", Vec::new()));

    FailedRequest {
        method,
        path,
        request_id,
        status,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        source,
        chain,
    }
    .log();

    response
}
