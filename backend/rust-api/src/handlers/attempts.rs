use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;
use validator::Validate;

use super::{ApiError, ApiResult};
use crate::error::{CoreError, PolicyCode};
use crate::extractors::AppJson;
use crate::middlewares::auth::JwtClaims;
use crate::models::attempt::{GradeAnswerRequest, SubmitAttemptRequest};
use crate::models::AttemptView;
use crate::services::{attempt_service::QuizAttemptService, AppState};

pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(quiz_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    tracing::info!("Starting attempt: user={}, quiz={}", claims.sub, quiz_id);

    let service = QuizAttemptService::new(&state);
    let attempt = service.start_attempt(&claims.sub, &quiz_id).await?;

    Ok((StatusCode::CREATED, Json(AttemptView::from(attempt))))
}

pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> ApiResult<Json<AttemptView>> {
    let service = QuizAttemptService::new(&state);
    let attempt = service
        .get_attempt(&attempt_id, &claims.sub, claims.user_role())
        .await?;

    Ok(Json(attempt.into()))
}

pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<SubmitAttemptRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate()?;
    tracing::info!(
        "Submitting attempt: user={}, attempt={}, answers={}",
        claims.sub,
        attempt_id,
        req.answers.len()
    );

    let service = QuizAttemptService::new(&state);
    let result = service
        .submit_attempt(&attempt_id, &claims.sub, &req.answers)
        .await?;

    Ok(Json(result))
}

pub async fn grade_answer(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path((attempt_id, question_id)): Path<(String, String)>,
    AppJson(req): AppJson<GradeAnswerRequest>,
) -> ApiResult<Json<AttemptView>> {
    if !claims.user_role().can_grade() {
        return Err(ApiError(CoreError::policy(
            PolicyCode::GraderRoleRequired,
            "Only teachers and admins can grade answers",
        )));
    }
    req.validate()?;

    tracing::info!(
        "Grading answer: grader={}, attempt={}, question={}",
        claims.sub,
        attempt_id,
        question_id
    );

    let service = QuizAttemptService::new(&state);
    let attempt = service
        .grade_answer(&attempt_id, &claims.sub, &question_id, &req)
        .await?;

    Ok(Json(attempt.into()))
}
