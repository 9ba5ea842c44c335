//! HTTP interface over the orchestrator.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::BatchError;
use crate::orchestrator::{Orchestrator, SubmitRequest};
use crate::scheduler::job::{JobId, JobRun, JobState};

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CancelJobRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    state: Option<String>,
}

/// Job record plus its array children, when it has any.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub run: JobRun,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub child_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChildStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub attempts: u32,
}

pub struct ApiError(BatchError);

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &BatchError) -> StatusCode {
    match err {
        BatchError::JobNotFound(_)
        | BatchError::QueueNotFound(_)
        | BatchError::PoolNotFound(_)
        | BatchError::DefinitionNotFound(_) => StatusCode::NOT_FOUND,
        BatchError::DuplicateJob(_)
        | BatchError::CyclicDependency(_)
        | BatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BatchError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        BatchError::QueueFull(_) | BatchError::InsufficientCapacity(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/queues", get(list_queues_handler))
        .route("/api/pools", get(list_pools_handler))
        .layer(cors)
        .with_state(orchestrator)
}

/// Serve the API until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn submit_job_handler(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let job_id = orchestrator.submit(request)?;
    Ok(Json(SubmitJobResponse {
        job_id: job_id.to_string(),
    }))
}

async fn list_jobs_handler(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobRun>>, ApiError> {
    let state = query
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()?;
    Ok(Json(orchestrator.list_jobs(state)))
}

async fn job_status_handler(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = JobId::from(id);
    let run = orchestrator.get_job_status(&job_id)?;

    let mut children = Vec::new();
    let mut child_counts = BTreeMap::new();
    if run.is_array_parent() {
        for child in orchestrator.array_children(&job_id) {
            *child_counts.entry(child.state.to_string()).or_insert(0) += 1;
            children.push(ChildStatus {
                attempts: child.attempt_count(),
                job_id: child.job_id,
                state: child.state,
            });
        }
    }
    Ok(Json(JobStatusResponse {
        run,
        children,
        child_counts,
    }))
}

async fn cancel_job_handler(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
    body: Option<Json<CancelJobRequest>>,
) -> Result<Json<JobRun>, ApiError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "Cancelled by user".to_string());
    let run = orchestrator.cancel_job(&JobId::from(id), reason)?;
    Ok(Json(run))
}

async fn list_queues_handler(State(orchestrator): State<Orchestrator>) -> impl IntoResponse {
    Json(orchestrator.list_queues())
}

async fn list_pools_handler(State(orchestrator): State<Orchestrator>) -> impl IntoResponse {
    Json(orchestrator.list_pools())
}
