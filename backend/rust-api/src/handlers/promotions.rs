use axum::{extract::State, Extension, Json};
use std::sync::Arc;
use validator::Validate;

use super::ApiResult;
use crate::extractors::AppJson;
use crate::middlewares::auth::JwtClaims;
use crate::models::promotion::ApplyPromotionRequest;
use crate::models::PromotionQuote;
use crate::services::{promotion_service::PromotionService, AppState};

/// Prices a purchase with the code. Nothing is redeemed until checkout.
pub async fn apply_promotion(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<ApplyPromotionRequest>,
) -> ApiResult<Json<PromotionQuote>> {
    req.validate()?;

    let service = PromotionService::new(&state);
    let quote = service
        .quote(&req.code, &claims.sub, &req.product_id, req.purchase_amount)
        .await?;

    Ok(Json(quote))
}
