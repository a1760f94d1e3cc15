//! Request handlers for the service front.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use lakeloop_core::broker::{RequestKind, ResponseBody};

use super::ApiState;

/// Ingestion request body. `mode` is accepted for forward compatibility;
/// only `append` is implemented.
#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub records: Vec<Value>,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "append".to_string()
}

/// Job trigger request body.
#[derive(Debug, Deserialize)]
pub struct JobBody {
    pub job: String,
    #[serde(default)]
    pub arguments: Value,
}

fn error_body(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "status": "error", "error": error.to_string() }))
}

/// The owner answered with a body that does not match the request kind.
/// Unreachable while the dispatch table is in sync; mapped to an error
/// envelope rather than a panic.
fn mismatched(body: ResponseBody) -> Json<Value> {
    warn!("Unexpected broker response body: {body:?}");
    error_body("unexpected broker response")
}

/// `GET /api/health`: stack snapshot through the broker, proving the whole
/// bridge (handler, queue, owner loop) is live.
pub async fn health(State(state): State<ApiState>) -> Json<Value> {
    match state.broker.send(RequestKind::GetStackOutputs).await {
        Ok(ResponseBody::StackOutputs(outputs)) => Json(json!({
            "status": "healthy",
            "stack": outputs.stack_name,
            "outputs": outputs,
        })),
        Ok(other) => mismatched(other),
        Err(e) => error_body(e),
    }
}

/// `GET /api/resources`: top-level directories of the watched data root.
pub async fn list_resources(State(state): State<ApiState>) -> Json<Value> {
    let resources: Vec<Value> = top_level_dirs(&state)
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "path": state.data_dir.join(&name),
            })
        })
        .collect();

    Json(json!({ "status": "success", "resources": resources }))
}

/// `GET /api/resources/{name}/metadata`
pub async fn resource_metadata(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Json<Value> {
    match state
        .broker
        .send(RequestKind::GetResourceInfo { name })
        .await
    {
        Ok(ResponseBody::ResourceInfo(info)) => {
            let row_count = info.row_count;
            Json(json!({
                "status": "success",
                "resource": info,
                "row_count": row_count,
            }))
        }
        Ok(other) => mismatched(other),
        Err(e) => error_body(e),
    }
}

/// `POST /api/resources/{name}/ingest`: append records to a resource. The
/// name must be an existing top-level data directory.
pub async fn ingest(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<IngestBody>,
) -> Json<Value> {
    if !top_level_dirs(&state).iter().any(|d| *d == name) {
        return error_body(format!("{name} is not a data directory"));
    }
    if body.mode != "append" {
        return error_body(format!("unsupported ingest mode: {}", body.mode));
    }

    match state
        .broker
        .send(RequestKind::IngestRecords {
            resource: name,
            records: body.records,
        })
        .await
    {
        Ok(ResponseBody::Ingested { resource, count }) => Json(json!({
            "status": "success",
            "resource": resource,
            "count": count,
        })),
        Ok(other) => mismatched(other),
        Err(e) => error_body(e),
    }
}

/// `POST /api/jobs`: trigger a named processing job.
pub async fn trigger_job(State(state): State<ApiState>, Json(body): Json<JobBody>) -> Json<Value> {
    match state
        .broker
        .send(RequestKind::TriggerJob {
            job: body.job,
            arguments: body.arguments,
        })
        .await
    {
        Ok(ResponseBody::JobStarted { job, run_id }) => Json(json!({
            "status": "success",
            "job": job,
            "run_id": run_id,
        })),
        Ok(other) => mismatched(other),
        Err(e) => error_body(e),
    }
}

fn top_level_dirs(state: &ApiState) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(&state.data_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    dirs.sort();
    dirs
}
