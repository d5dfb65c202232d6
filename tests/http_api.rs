mod common;

use std::{sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tower::ServiceExt;

use docpress::application::jobs::{JobWorkerContext, QueuePolicy, RenderQueue, process_render_task};
use docpress::application::render::{ConcurrencyLimiter, PDF_SIGNATURE};
use docpress::application::repos::{
    FailureTransition, NewTaskRecord, QueueCounts, RepoError, StalledTask, TaskStore,
};
use docpress::domain::entities::{RenderResult, RenderTaskRecord};
use docpress::domain::types::TaskState;
use docpress::infra::http::{AppState, build_router};

use common::Harness;

const BODY_LIMIT: usize = 1024 * 1024;

fn router_for(context: &JobWorkerContext, delete_after_download: bool) -> Router {
    let state = AppState {
        queue: context.queue.clone(),
        renderer: Arc::clone(&context.renderer),
        limiter: ConcurrencyLimiter::new(4),
        output: Arc::clone(&context.output),
        delete_after_download,
        started_at: Instant::now(),
    };
    build_router(state, BODY_LIMIT)
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.expect("response")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request")
}

async fn body_bytes(response: Response) -> bytes::Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

fn invoice_body() -> Value {
    json!({
        "template": "invoice",
        "data": {
            "invoiceNumber": "INV-001",
            "items": [{"name": "Widget", "quantity": 2, "price": 100}]
        }
    })
}

#[tokio::test]
async fn export_returns_an_inline_pdf() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(&router, post_json("/pdf/export", invoice_body())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/pdf"
    );
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "inline; filename=\"invoice.pdf\""
    );
    let bytes = body_bytes(response).await;
    assert!(bytes.starts_with(PDF_SIGNATURE));
}

#[tokio::test]
async fn export_rejects_missing_template() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(&router, post_json("/pdf/export", json!({"data": {}}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_input");
}

#[tokio::test]
async fn export_of_unknown_template_is_not_found() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(
        &router,
        post_json("/pdf/export", json!({"template": "does-not-exist", "data": {}})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "template_not_found");
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let request = Request::post("/pdf/generate-async")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn preview_renders_html_without_the_engine() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(&router, post_json("/pdf/preview", invoice_body())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = String::from_utf8(body_bytes(response).await.to_vec()).expect("utf-8");
    assert!(html.contains("<h1>INV-001</h1>"));
    assert_eq!(
        harness
            .launcher
            .launches
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn template_source_is_served_as_plain_text() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(&router, get("/pdf/templates/invoice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let source = String::from_utf8(body_bytes(response).await.to_vec()).expect("utf-8");
    assert_eq!(source, common::INVOICE_TEMPLATE);

    let response = send(&router, get("/pdf/templates/does-not-exist")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "template_not_found");
}

#[tokio::test]
async fn async_generation_round_trip() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, true);

    let response = send(&router, post_json("/pdf/generate-async", invoice_body())).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["queuePosition"], 1);
    let task_id = body["taskId"].as_str().expect("task id").to_string();
    assert_eq!(body["statusUrl"], format!("/pdf/task/{task_id}"));

    let response = send(&router, get(&format!("/pdf/task/{task_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["status"], "queued");
    assert_eq!(status["progress"], 0);

    // Not downloadable before completion.
    let response = send(&router, get(&format!("/pdf/download/{task_id}"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "task_not_ready");

    let leased = harness
        .queue()
        .lease("w1")
        .await
        .expect("lease")
        .expect("task");
    process_render_task(&harness.context, leased).await;

    let response = send(&router, get(&format!("/pdf/task/{task_id}"))).await;
    let status = body_json(response).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["progress"], 100);
    assert!(status["result"]["fileSize"].as_u64().expect("file size") > 0);

    let response = send(&router, get(&format!("/pdf/download/{task_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"{task_id}.pdf\"").as_str()
    );
    assert!(body_bytes(response).await.starts_with(PDF_SIGNATURE));

    // Deleted after the first download.
    let response = send(&router, get(&format!("/pdf/download/{task_id}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(&router, get("/pdf/task/01HZZZZZZZZZZZZZZZZZZZZZZZ")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&router, get("/pdf/download/01HZZZZZZZZZZZZZZZZZZZZZZZ")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_task_id_conflicts() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let mut body = invoice_body();
    body["taskId"] = json!("monthly-report");
    let first = send(&router, post_json("/pdf/generate-async", body.clone())).await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let second = send(&router, post_json("/pdf/generate-async", body)).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn queue_status_reports_counts() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);
    send(&router, post_json("/pdf/generate-async", invoice_body())).await;

    let response = send(&router, get("/pdf/queue/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["healthy"], true);
    assert_eq!(body["waiting"], 1);
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn health_and_index_respond() {
    let harness = Harness::new(QueuePolicy::default());
    let router = router_for(&harness.context, false);

    let response = send(&router, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sync"]["limit"], 4);

    let response = send(&router, get("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "docpress");

    let response = send(&router, get("/no/such/route")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-request-id"));
}

/// Store whose backend is permanently unreachable.
struct UnreachableStore;

fn unreachable_error() -> RepoError {
    RepoError::unavailable("connection refused")
}

#[async_trait]
impl TaskStore for UnreachableStore {
    async fn insert(&self, _task: NewTaskRecord) -> Result<RenderTaskRecord, RepoError> {
        Err(unreachable_error())
    }

    async fn lease(
        &self,
        _owner: &str,
        _now: OffsetDateTime,
        _visibility: Duration,
    ) -> Result<Option<RenderTaskRecord>, RepoError> {
        Err(unreachable_error())
    }

    async fn touch_progress(
        &self,
        _id: &str,
        _owner: &str,
        _progress: u8,
        _now: OffsetDateTime,
        _visibility: Duration,
    ) -> Result<(), RepoError> {
        Err(unreachable_error())
    }

    async fn mark_completed(
        &self,
        _id: &str,
        _owner: &str,
        _result: &RenderResult,
        _now: OffsetDateTime,
    ) -> Result<(), RepoError> {
        Err(unreachable_error())
    }

    async fn record_failure(
        &self,
        _id: &str,
        _owner: &str,
        _transition: &FailureTransition,
    ) -> Result<(), RepoError> {
        Err(unreachable_error())
    }

    async fn reclaim_stalled(&self, _now: OffsetDateTime) -> Result<Vec<StalledTask>, RepoError> {
        Err(unreachable_error())
    }

    async fn find(&self, _id: &str) -> Result<Option<RenderTaskRecord>, RepoError> {
        Err(unreachable_error())
    }

    async fn position(&self, _id: &str, _now: OffsetDateTime) -> Result<Option<u64>, RepoError> {
        Err(unreachable_error())
    }

    async fn counts(&self) -> Result<QueueCounts, RepoError> {
        Err(unreachable_error())
    }

    async fn purge_finished(
        &self,
        _state: TaskState,
        _finished_before: OffsetDateTime,
    ) -> Result<Vec<RenderTaskRecord>, RepoError> {
        Err(unreachable_error())
    }

    async fn ping(&self) -> Result<(), RepoError> {
        Err(unreachable_error())
    }
}

#[tokio::test]
async fn queue_outage_keeps_the_synchronous_path_alive() {
    let harness = Harness::new(QueuePolicy::default());
    let context = JobWorkerContext {
        queue: RenderQueue::new(Arc::new(UnreachableStore), QueuePolicy::default()),
        ..harness.context.clone()
    };
    let router = router_for(&context, false);

    let response = send(&router, post_json("/pdf/generate-async", invoice_body())).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "queue_unavailable");
    assert!(
        body["error"]["hint"]
            .as_str()
            .expect("hint")
            .contains("/pdf/export")
    );

    let response = send(&router, get("/pdf/queue/status")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["healthy"], false);

    let response = send(&router, post_json("/pdf/export", invoice_body())).await;
    assert_eq!(response.status(), StatusCode::OK);
}
