//! Admin-only endpoints: payment verification and settlement, quiz publishing.
//! Mounted behind `auth_middleware` and `admin_guard_middleware`.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

use super::ApiResult;
use crate::extractors::AppJson;
use crate::middlewares::auth::JwtClaims;
use crate::models::payment::{RefundRequest, SmsVerifyRequest};
use crate::models::PaymentView;
use crate::services::{
    content_service::ContentService, payment_service::PaymentService, AppState,
};

pub async fn request_sms_code(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(payment_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let service = PaymentService::new(&state);
    let ttl = service.request_sms_code(&payment_id, &claims.sub).await?;

    Ok(Json(json!({
        "payment_id": payment_id,
        "expires_in_seconds": ttl.as_secs(),
    })))
}

pub async fn verify_sms_code(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
    AppJson(req): AppJson<SmsVerifyRequest>,
) -> ApiResult<Json<PaymentView>> {
    req.validate()?;

    let service = PaymentService::new(&state);
    let payment = service.confirm_sms_code(&payment_id, &req.code).await?;

    Ok(Json(payment.into()))
}

pub async fn complete_payment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(payment_id): Path<String>,
) -> ApiResult<Json<PaymentView>> {
    tracing::info!("Completing payment {} by admin {}", payment_id, claims.sub);

    let service = PaymentService::new(&state);
    let payment = service.complete_payment(&payment_id, &claims.sub).await?;

    Ok(Json(payment.into()))
}

pub async fn refund_payment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(payment_id): Path<String>,
    AppJson(req): AppJson<RefundRequest>,
) -> ApiResult<Json<PaymentView>> {
    req.validate()?;

    let service = PaymentService::new(&state);
    let payment = service
        .refund_payment(&payment_id, &claims.sub, &req.reason)
        .await?;

    Ok(Json(payment.into()))
}

pub async fn publish_quiz(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(quiz_id): Path<String>,
) -> ApiResult<Json<Value>> {
    tracing::info!("Publishing quiz {} by admin {}", quiz_id, claims.sub);

    let service = ContentService::new(&state);
    let quiz = service.publish_quiz(&quiz_id).await?;

    Ok(Json(json!({
        "id": quiz.id,
        "status": quiz.status,
        "question_count": quiz.questions.len(),
        "updated_at": quiz.updated_at,
    })))
}
