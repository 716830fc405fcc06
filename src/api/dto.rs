use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request body for `PUT /device`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SelectDeviceRequest {
    pub device_id: String,
}

/// Request body for `PUT /visibility`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VisibilityRequest {
    pub visible: bool,
}

/// Response for `PUT /device`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SelectDeviceResponse {
    pub device_id: Option<String>,
    /// `false` when the circuits or readings could not be fetched; the
    /// previous selection or cache is then still being served.
    pub loaded: bool,
}
