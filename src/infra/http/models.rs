use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::render::{EngineSnapshot, LifecycleState};

/// Body accepted by the export, preview and enqueue endpoints.
///
/// Fields stay loosely typed so validation failures come back as
/// `invalid_input` errors instead of extractor rejections.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub template: Option<String>,
    pub data: Option<Value>,
    pub options: Option<Value>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub task_id: String,
    pub status: &'static str,
    pub queue_position: u64,
    pub status_url: String,
    pub download_url: String,
}

impl EnqueueResponse {
    pub fn queued(task_id: String, queue_position: u64) -> Self {
        Self {
            status_url: format!("/pdf/task/{task_id}"),
            download_url: format!("/pdf/download/{task_id}"),
            task_id,
            status: "queued",
            queue_position,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub state: Option<LifecycleState>,
    pub renders_served: u64,
    pub open_contexts: usize,
    pub recycle_threshold: u64,
}

impl From<EngineSnapshot> for EngineHealth {
    fn from(snapshot: EngineSnapshot) -> Self {
        Self {
            state: snapshot.state,
            renders_served: snapshot.renders_served,
            open_contexts: snapshot.open_contexts,
            recycle_threshold: snapshot.recycle_threshold,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub in_flight: usize,
    pub queued: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since the process started serving.
    pub uptime: u64,
    pub timestamp: String,
    pub engine: EngineHealth,
    pub sync: SyncHealth,
}

#[derive(Debug, Serialize)]
pub struct ServiceIndex {
    pub name: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Serialize)]
pub struct EndpointInfo {
    pub method: &'static str,
    pub path: &'static str,
    pub description: &'static str,
}

pub const ENDPOINTS: &[(&str, &str, &str)] = &[
    ("GET", "/health", "Service health"),
    ("POST", "/pdf/export", "Render a document synchronously"),
    ("POST", "/pdf/preview", "Render a template to HTML"),
    ("GET", "/pdf/templates/{name}", "Template source"),
    ("POST", "/pdf/generate-async", "Queue a render task"),
    ("GET", "/pdf/task/{taskId}", "Task status"),
    ("GET", "/pdf/download/{taskId}", "Download a finished document"),
    ("GET", "/pdf/queue/status", "Queue health"),
];
