use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;
use validator::Validate;

use super::ApiResult;
use crate::extractors::AppJson;
use crate::middlewares::auth::JwtClaims;
use crate::models::payment::{CheckoutRequest, GatewayNotification};
use crate::models::PaymentView;
use crate::services::{payment_service::PaymentService, AppState};

pub async fn checkout(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<CheckoutRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate()?;
    tracing::info!(
        "Checkout: user={}, type={}, target={}",
        claims.sub,
        req.business_type.as_str(),
        req.target_ref
    );

    let service = PaymentService::new(&state);
    let payment = service.checkout(&claims.sub, req).await?;

    Ok((StatusCode::CREATED, Json(PaymentView::from(payment))))
}

pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(payment_id): Path<String>,
) -> ApiResult<Json<PaymentView>> {
    let service = PaymentService::new(&state);
    let payment = service
        .get_payment(&payment_id, &claims.sub, claims.user_role())
        .await?;

    Ok(Json(payment.into()))
}

/// Gateway callback. Signature checks happen in front of this service.
pub async fn gateway_webhook(
    State(state): State<Arc<AppState>>,
    AppJson(notification): AppJson<GatewayNotification>,
) -> ApiResult<Json<PaymentView>> {
    tracing::info!(
        "Gateway notification: external_id={}, status={}",
        notification.external_payment_id,
        notification.status.as_str()
    );

    let service = PaymentService::new(&state);
    let payment = service.apply_gateway_notification(notification).await?;

    Ok(Json(payment.into()))
}
