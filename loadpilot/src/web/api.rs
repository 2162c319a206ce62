//! REST API handlers for runs and approvals

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{ApprovalRequest, Run, RunFilter, RunSummary, StoreError};
use crate::events::StreamEvent;
use crate::orchestrator::EngineError;

use super::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn err(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn store_err(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => err(StatusCode::NOT_FOUND, e.to_string()),
        StoreError::TerminalRun(_)
        | StoreError::AlreadyResolved(_)
        | StoreError::VersionConflict(_) => err(StatusCode::CONFLICT, e.to_string()),
        _ => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn engine_err(e: EngineError) -> ApiError {
    match e {
        EngineError::Store(inner) => store_err(inner),
        EngineError::Cancelled(_) | EngineError::NotSuspended(_) => {
            err(StatusCode::CONFLICT, e.to_string())
        }
        EngineError::WorkflowNotFound(_) => err(StatusCode::NOT_FOUND, e.to_string()),
        _ => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub workflow_name: String,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub input: serde_json::Value,
}

fn default_tenant() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub workflow: String,
    pub tenant_id: String,
    pub phase: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub candidate_id: Option<String>,
    pub outcome: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Run> for RunResponse {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            workflow: run.workflow,
            tenant_id: run.tenant_id,
            phase: run.phase.to_string(),
            attempt: run.attempt,
            max_attempts: run.max_attempts,
            candidate_id: run.candidate.map(|c| c.id),
            outcome: run.outcome.map(|o| o.to_string()),
            reason: run.reason,
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummaryResponse {
    pub id: String,
    pub workflow: String,
    pub tenant_id: String,
    pub phase: String,
    pub attempt: u32,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<RunSummary> for RunSummaryResponse {
    fn from(run: RunSummary) -> Self {
        Self {
            id: run.id,
            workflow: run.workflow,
            tenant_id: run.tenant_id,
            phase: run.phase.to_string(),
            attempt: run.attempt,
            outcome: run.outcome.map(|o| o.to_string()),
            created_at: run.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub id: String,
    pub run_id: String,
    pub urgency: String,
    pub recommended_action: String,
    pub amount: Option<f64>,
    pub status: String,
    pub reviewer: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ApprovalRequest> for ApprovalResponse {
    fn from(a: ApprovalRequest) -> Self {
        Self {
            id: a.id,
            run_id: a.run_id,
            urgency: a.urgency.to_string(),
            recommended_action: a.recommended_action,
            amount: a.amount,
            status: a.status.to_string(),
            reviewer: a.reviewer,
            reviewed_at: a.reviewed_at,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub name: String,
    pub description: String,
    pub max_attempts: u32,
}

// ============================================================================
// Run Handlers
// ============================================================================

/// POST /api/runs — acknowledge synchronously, execute asynchronously
pub async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), ApiError> {
    let spec = state
        .workflows
        .get(&req.workflow_name)
        .cloned()
        .ok_or_else(|| {
            err(
                StatusCode::NOT_FOUND,
                format!("workflow not found: {}", req.workflow_name),
            )
        })?;

    let run = state
        .db
        .start_run(&spec.name, &req.tenant_id, &req.input, spec.max_attempts)
        .map_err(store_err)?;
    let run_id = run.id.clone();

    let engine = state.engine.clone();
    let agents = state.agents.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.execute(&spec, &agents, run).await {
            tracing::error!(error = %e, "Run execution failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(CreateRunResponse { run_id })))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub workflow: Option<String>,
    pub phase: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// GET /api/runs
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunSummaryResponse>>, ApiError> {
    let phase = match query.phase.as_deref() {
        Some(s) => Some(
            s.parse()
                .map_err(|_| err(StatusCode::BAD_REQUEST, format!("unknown phase: {}", s)))?,
        ),
        None => None,
    };

    let filter = RunFilter {
        workflow: query.workflow,
        phase,
        limit: query.limit,
        offset: query.offset,
    };

    let runs = state.db.list_runs(&filter).map_err(store_err)?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}

/// GET /api/runs/:id
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state
        .db
        .get_run(&id)
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("run not found: {}", id)))?;
    Ok(Json(run.into()))
}

/// GET /api/runs/:id/events — the persisted event log
pub async fn get_run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StreamEvent>>, ApiError> {
    if state.db.get_run(&id).map_err(store_err)?.is_none() {
        return Err(err(StatusCode::NOT_FOUND, format!("run not found: {}", id)));
    }
    let events = state.db.events_after(&id, 0).map_err(store_err)?;
    Ok(Json(events))
}

/// POST /api/runs/:id/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    state.db.request_cancel(&id).map_err(store_err)?;

    // A run parked for review has no task left to observe the flag;
    // finalize it here
    let mut run = state
        .db
        .get_run(&id)
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("run not found: {}", id)))?;
    if run.phase == crate::db::RunPhase::Escalated {
        run = state.engine.finish_cancelled(run).map_err(engine_err)?;
    }

    Ok(Json(run.into()))
}

// ============================================================================
// Approval Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListApprovalsQuery {
    pub status: Option<String>,
}

/// GET /api/approvals
pub async fn list_approvals(
    State(state): State<AppState>,
    Query(query): Query<ListApprovalsQuery>,
) -> Result<Json<Vec<ApprovalResponse>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse()
                .map_err(|_| err(StatusCode::BAD_REQUEST, format!("unknown status: {}", s)))?,
        ),
        None => None,
    };

    let approvals = state.db.list_approvals(status).map_err(store_err)?;
    Ok(Json(approvals.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct ResolveApprovalRequest {
    pub reviewer: String,
}

/// POST /api/approvals/:id/approve
pub async fn approve_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveApprovalRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state
        .engine
        .resolve_approval(&state.workflows, &id, true, &req.reviewer)
        .await
        .map_err(engine_err)?;
    Ok(Json(run.into()))
}

/// POST /api/approvals/:id/reject
pub async fn reject_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveApprovalRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state
        .engine
        .resolve_approval(&state.workflows, &id, false, &req.reviewer)
        .await
        .map_err(engine_err)?;
    Ok(Json(run.into()))
}

// ============================================================================
// Misc
// ============================================================================

/// GET /api/workflows
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowResponse>> {
    let mut workflows: Vec<WorkflowResponse> = state
        .workflows
        .values()
        .map(|w| WorkflowResponse {
            name: w.name.clone(),
            description: w.description.clone(),
            max_attempts: w.max_attempts,
        })
        .collect();
    workflows.sort_by(|a, b| a.name.cmp(&b.name));
    Json(workflows)
}

/// GET /api/health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
