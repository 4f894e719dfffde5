use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::PipelineError,
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::requests::{
        CreateAttemptRequest, MediaUploadQuery, SubmitSpeakingRequest, TeacherEvaluationRequest,
        UpdateContentRequest,
    },
    services::{media_service::MediaUpload, AppState},
};

use super::validate_request;

/// POST /attempts
pub async fn create_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<CreateAttemptRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    validate_request(&req)?;
    tracing::info!(
        learner = %claims.sub,
        prompt = %req.prompt_id,
        skill = req.skill_type.as_str(),
        "Creating attempt"
    );

    let attempt = state
        .attempts
        .create_attempt(&claims.sub, &req.prompt_id, req.skill_type)
        .await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

/// GET /attempts/{id}
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    let attempt = state.attempts.get_attempt(&claims.sub, &attempt_id).await?;
    Ok(Json(attempt))
}

/// PUT /attempts/{id}/content
pub async fn update_content(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<UpdateContentRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let word_count = state
        .attempts
        .update_writing_content(&claims.sub, &attempt_id, &req.content, req.is_auto_save)
        .await?;
    Ok(Json(json!({ "word_count": word_count })))
}

/// POST /attempts/{id}/media?file_name=..&duration_seconds=..
pub async fn upload_media(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    Query(query): Query<MediaUploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, PipelineError> {
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    tracing::info!(
        attempt = %attempt_id,
        file = %query.file_name,
        size = body.len(),
        "Uploading recording"
    );

    let upload = MediaUpload {
        file_name: query.file_name,
        duration_seconds: query.duration_seconds,
        mime_type,
        bytes: body.to_vec(),
    };
    let media = state.media.attach(&claims.sub, &attempt_id, upload).await?;
    Ok((StatusCode::CREATED, Json(media)))
}

/// GET /attempts/{id}/media
pub async fn list_media(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    let media = state.media.list_for(&claims.sub, &attempt_id).await?;
    Ok(Json(media))
}

/// DELETE /attempts/{id}/media/{media_id}
pub async fn delete_media(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path((attempt_id, media_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, PipelineError> {
    state
        .media
        .detach(&claims.sub, &attempt_id, &media_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /attempts/{id}/submit/speaking
pub async fn submit_speaking(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<SubmitSpeakingRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let accepted = state
        .gateway
        .submit_speaking(&claims.sub, &attempt_id, req.selected_media_id.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// POST /attempts/{id}/submit/writing
pub async fn submit_writing(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    let accepted = state
        .gateway
        .submit_writing(&claims.sub, &attempt_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// GET /attempts/{id}/result
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    let attempt = state.attempts.get_attempt(&claims.sub, &attempt_id).await?;
    let result = state.orchestrator.get_scoring_result(&attempt).await?;
    Ok(Json(result))
}

/// POST /attempts/{id}/rescore
pub async fn request_rescore(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    let job = state
        .gateway
        .request_rescore(&claims.sub, &attempt_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job.id }))))
}

/// POST /attempts/{id}/evaluation (teacher or admin)
pub async fn evaluate_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<TeacherEvaluationRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    if !claims.can_evaluate() {
        return Err(PipelineError::forbidden(
            "teacher or admin role required to evaluate attempts",
        ));
    }

    let attempt = state
        .attempts
        .evaluate_by_teacher(
            &claims.sub,
            &attempt_id,
            req.teacher_score,
            req.teacher_comment,
        )
        .await?;
    Ok(Json(attempt))
}
