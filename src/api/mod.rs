pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, put},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::aggregator::TelemetryAggregator;
use handlers::ApiDoc;

pub fn router(aggregator: Arc<TelemetryAggregator>) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/view", get(handlers::get_view))
        .route("/view-mode", put(handlers::put_view_mode))
        .route("/device", put(handlers::put_device))
        .route("/visibility", put(handlers::put_visibility))
        .route("/circuits", get(handlers::get_circuits))
        .route("/health", get(handlers::health))
        .with_state(aggregator)
        .split_for_parts();

    router.route(
        "/api-docs/openapi.json",
        get(move || async move { axum::Json(api) }),
    )
}
