use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod grading;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod promotions;
pub mod services;
pub mod stores;
pub mod utils;

pub use config::Config;
pub use error::{CoreError, CoreResult, PolicyCode};
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        // Public endpoints (no auth required)
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .route(
            "/api/v1/payments/webhook",
            post(handlers::payments::gateway_webhook),
        )
        // Protected endpoints (require JWT)
        .nest(
            "/api/v1",
            api_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .nest(
            "/admin",
            admin_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .with_state(app_state)
        .layer(cors)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/quizzes/{id}/attempts",
            post(handlers::attempts::start_attempt),
        )
        .route("/attempts/{id}", get(handlers::attempts::get_attempt))
        .route(
            "/attempts/{id}/submit",
            post(handlers::attempts::submit_attempt),
        )
        .route(
            "/attempts/{id}/answers/{question_id}/grade",
            post(handlers::attempts::grade_answer),
        )
        .route(
            "/promotions/apply",
            post(handlers::promotions::apply_promotion),
        )
        .route("/payments", post(handlers::payments::checkout))
        .route("/payments/{id}", get(handlers::payments::get_payment))
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/payments/{id}/sms-code",
            post(handlers::admin::request_sms_code),
        )
        .route(
            "/payments/{id}/sms-verify",
            post(handlers::admin::verify_sms_code),
        )
        .route(
            "/payments/{id}/complete",
            post(handlers::admin::complete_payment),
        )
        .route(
            "/payments/{id}/refund",
            post(handlers::admin::refund_payment),
        )
        .route(
            "/quizzes/{id}/publish",
            post(handlers::admin::publish_quiz),
        )
        .route_layer(middleware::from_fn(
            middlewares::auth::admin_guard_middleware,
        ))
}
