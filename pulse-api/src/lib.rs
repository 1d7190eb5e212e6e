pub mod handlers;
pub mod server;
pub mod state;

use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use pulse_core::{AnomalyKind, PulseError, Severity};
use pulse_engine::AnomalyQuery;
use serde::{Deserialize, Serialize};

pub use server::ApiServer;
pub use state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Query string of `GET /api/v1/anomalies`. Values arrive as text and are
/// parsed so a bad value gets an `ApiResponse` error body.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnomalyQueryParams {
    #[serde(rename = "type")]
    pub anomaly_type: Option<String>,
    pub severity: Option<String>,
    pub entity: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

impl TryFrom<AnomalyQueryParams> for AnomalyQuery {
    type Error = ApiError;

    fn try_from(params: AnomalyQueryParams) -> Result<Self, ApiError> {
        let kind = params
            .anomaly_type
            .map(|t| t.parse::<AnomalyKind>())
            .transpose()
            .map_err(|_| ApiError::bad_request("unknown anomaly type"))?;
        let severity = params
            .severity
            .map(|s| s.parse::<Severity>())
            .transpose()
            .map_err(|_| ApiError::bad_request("unknown severity"))?;

        Ok(AnomalyQuery {
            since: params.since,
            kind,
            severity,
            entity: params.entity,
            limit: params.limit,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub running: bool,
    pub uptime_secs: u64,
}

pub type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<()>::error(self.message));
        (self.status, body).into_response()
    }
}

impl From<PulseError> for ApiError {
    fn from(err: PulseError) -> Self {
        let status = match err {
            PulseError::UnknownMetricType(_) | PulseError::InvalidMetric(_) => StatusCode::BAD_REQUEST,
            PulseError::AlreadyRunning | PulseError::NotRunning => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}
