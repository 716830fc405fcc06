use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use utoipa::OpenApi;

use super::{
    dto::{SelectDeviceRequest, SelectDeviceResponse, VisibilityRequest},
    errors::AppError,
};
use crate::{
    aggregator::{
        view::{CircuitStatus, MinuteBucket, TodaySummary, ViewMode, ViewModel},
        RefreshOutcome, TelemetryAggregator,
    },
    db::models::Reading,
    summaries::{ConsumptionComparison, DailyEnergy, DailyEnergySummary, HourlyCost, HourlyCostSummary},
};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Last rendered view model.
#[utoipa::path(
    get,
    path = "/view",
    responses(
        (status = 200, description = "Current view model", body = ViewModel),
    ),
    tag = "telemetry"
)]
pub async fn get_view(State(aggregator): State<Arc<TelemetryAggregator>>) -> Json<ViewModel> {
    Json(aggregator.view())
}

/// Switch between the aggregate and a single-circuit view. Served from the
/// cache; nothing is fetched.
#[utoipa::path(
    put,
    path = "/view-mode",
    request_body = ViewMode,
    responses(
        (status = 200, description = "View rendered in the new mode", body = ViewModel),
        (status = 404, description = "Circuit does not belong to the active device"),
    ),
    tag = "telemetry"
)]
pub async fn put_view_mode(
    State(aggregator): State<Arc<TelemetryAggregator>>,
    Json(mode): Json<ViewMode>,
) -> Result<Json<ViewModel>, AppError> {
    Ok(Json(aggregator.set_view_mode(mode).await?))
}

/// Select the active device and reload its circuits and readings.
#[utoipa::path(
    put,
    path = "/device",
    request_body = SelectDeviceRequest,
    responses(
        (status = 200, description = "Selection result", body = SelectDeviceResponse),
    ),
    tag = "telemetry"
)]
pub async fn put_device(
    State(aggregator): State<Arc<TelemetryAggregator>>,
    Json(body): Json<SelectDeviceRequest>,
) -> Json<SelectDeviceResponse> {
    let outcome = aggregator.select_device(&body.device_id).await;
    Json(SelectDeviceResponse {
        device_id: aggregator.device_id().await,
        loaded: matches!(outcome, RefreshOutcome::Applied { .. }),
    })
}

/// Report whether the consuming view is visible. Hidden suspends polling.
#[utoipa::path(
    put,
    path = "/visibility",
    request_body = VisibilityRequest,
    responses(
        (status = 204, description = "Visibility applied"),
    ),
    tag = "telemetry"
)]
pub async fn put_visibility(
    State(aggregator): State<Arc<TelemetryAggregator>>,
    Json(body): Json<VisibilityRequest>,
) -> StatusCode {
    aggregator.set_visibility(body.visible).await;
    StatusCode::NO_CONTENT
}

/// Circuits of the active device with their on/off state.
#[utoipa::path(
    get,
    path = "/circuits",
    responses(
        (status = 200, description = "Circuits of the active device", body = Vec<CircuitStatus>),
    ),
    tag = "telemetry"
)]
pub async fn get_circuits(
    State(aggregator): State<Arc<TelemetryAggregator>>,
) -> Json<Vec<CircuitStatus>> {
    Json(aggregator.circuits().await)
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(get_view, put_view_mode, put_device, put_visibility, get_circuits, health),
    components(schemas(
        ViewModel,
        ViewMode,
        MinuteBucket,
        TodaySummary,
        CircuitStatus,
        Reading,
        DailyEnergy,
        DailyEnergySummary,
        HourlyCost,
        HourlyCostSummary,
        ConsumptionComparison,
        SelectDeviceRequest,
        SelectDeviceResponse,
        VisibilityRequest,
    )),
    tags(
        (name = "telemetry", description = "Circuit telemetry view endpoints"),
        (name = "system",    description = "System endpoints"),
    ),
    info(
        title = "Circuit Monitor API",
        version = "0.1.0",
        description = "Live power view over household circuit telemetry"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
