use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::PipelineError,
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::{
        requests::{DrainRequest, JobListQuery, UpsertPromptRequest},
        Prompt,
    },
    services::AppState,
};

use super::validate_request;

/// GET /admin/scoring/jobs?limit=
pub async fn list_pending_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobListQuery>,
) -> Result<impl IntoResponse, PipelineError> {
    let jobs = state
        .orchestrator
        .queue()
        .list_pending(query.limit)
        .await?;
    Ok(Json(jobs))
}

/// POST /admin/scoring/jobs/{id}/process
pub async fn process_job(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    tracing::info!(admin = %claims.sub, job = %job_id, "Processing job on demand");
    let outcome = state.orchestrator.process_job(&job_id).await?;
    Ok(Json(json!({ "job_id": job_id, "result": outcome })))
}

/// POST /admin/scoring/drain
pub async fn drain_pending(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<DrainRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    tracing::info!(admin = %claims.sub, limit = req.limit, "Draining pending jobs");
    let processed = state.orchestrator.drain_pending(req.limit).await?;
    Ok(Json(json!({
        "processed": processed.len(),
        "jobs": processed,
    })))
}

/// PUT /admin/prompts/{id}
pub async fn upsert_prompt(
    State(state): State<Arc<AppState>>,
    Path(prompt_id): Path<String>,
    AppJson(req): AppJson<UpsertPromptRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    validate_request(&req)?;

    let prompt = state
        .attempts
        .upsert_prompt(Prompt {
            id: prompt_id,
            skill_type: req.skill_type,
            task_type: req.task_type,
            title: req.title,
            text: req.text,
        })
        .await?;
    Ok(Json(prompt))
}
