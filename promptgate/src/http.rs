//! HTTP API over the prompt client.
//!
//! Thin layer: handlers translate between JSON and `PromptClient` calls and
//! let `Error`'s `IntoResponse` implementation map failures to status codes.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::client::PromptClient;
use crate::error::{Error, Result};
use crate::tool::ToolClient;
use crate::types::{BatchResult, Job, JobId, PromptOptions, PromptResponse};

/// Build the API router.
pub fn router<T: ToolClient + 'static>(client: Arc<PromptClient<T>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/usage", get(usage))
        .route("/prompt", post(prompt))
        .route("/prompt/async", post(prompt_async))
        .route("/batch", post(batch))
        .route("/cache/clear", post(clear_cache))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(client)
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    prompt: String,
    #[serde(default)]
    options: PromptOptions,
    #[serde(default = "default_use_cache")]
    use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    prompts: Vec<BatchItem>,
    #[serde(default = "default_use_cache")]
    use_cache: bool,
    /// When set, block until every job is terminal and return the
    /// position-aligned outcomes instead of job ids.
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    prompt: String,
    #[serde(default)]
    options: PromptOptions,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: &'static str,
    check_url: String,
}

/// One-line job view for listings.
#[derive(Debug, Serialize)]
struct JobSummary {
    id: Uuid,
    status: &'static str,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.as_uuid(),
            status: job.status.name(),
            created_at: job.created_at,
            completed_at: job.completed_at(),
        }
    }
}

async fn health<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
) -> impl IntoResponse {
    // Health stays up even when the ledger is unhappy; the usage snapshot is
    // best-effort here.
    let usage = client.usage().await.ok();
    Json(json!({ "status": "ok", "usage": usage }))
}

async fn usage<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
) -> Result<impl IntoResponse> {
    Ok(Json(client.usage().await?))
}

async fn prompt<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
    Json(request): Json<PromptRequest>,
) -> Result<Json<PromptResponse>> {
    let response = client
        .prompt(&request.prompt, &request.options, request.use_cache)
        .await?;
    Ok(Json(response))
}

async fn prompt_async<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
    Json(request): Json<PromptRequest>,
) -> Result<impl IntoResponse> {
    if request.prompt.trim().is_empty() {
        return Err(Error::InvalidInput("prompt must not be empty".to_string()));
    }
    let id = client.prompt_async(request.prompt, request.options, request.use_cache);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: id.as_uuid(),
            status: "queued",
            check_url: format!("/jobs/{}", id.as_uuid()),
        }),
    ))
}

async fn batch<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
    Json(request): Json<BatchRequest>,
) -> Result<axum::response::Response> {
    if request.prompts.is_empty() {
        return Err(Error::InvalidInput(
            "batch must contain at least one prompt".to_string(),
        ));
    }
    let prompts: Vec<(String, PromptOptions)> = request
        .prompts
        .into_iter()
        .map(|item| (item.prompt, item.options))
        .collect();

    if request.wait {
        let outcomes: BatchResult = client.batch(prompts, request.use_cache).await?;
        return Ok(Json(outcomes).into_response());
    }

    let ids: Vec<Uuid> = client
        .batch_async(prompts, request.use_cache)
        .into_iter()
        .map(|id| id.as_uuid())
        .collect();
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_ids": ids }))).into_response())
}

async fn clear_cache<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
) -> Result<impl IntoResponse> {
    client.clear_cache().await?;
    Ok(Json(json!({ "cleared": true })))
}

async fn list_jobs<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
) -> impl IntoResponse {
    let mut jobs = client.jobs();
    jobs.sort_by_key(|job| job.created_at);
    let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
    Json(summaries)
}

async fn get_job<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    Ok(Json(client.job_status(JobId::from(id))?))
}

async fn cancel_job<T: ToolClient + 'static>(
    State(client): State<Arc<PromptClient<T>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    let id = JobId::from(id);
    client.cancel(id)?;
    Ok(Json(client.job_status(id)?))
}
