//! Projects `OrchestratorError` into the `{statusCode, code, message}`
//! envelope every HTTP endpoint uses for failures.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::OrchestratorError;

use super::dto::ErrorEnvelope;

pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.0.status_code();
        let envelope =
            ErrorEnvelope { status_code, code: self.0.code().to_string(), message: self.0.to_string() };
        let status =
            StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(envelope)).into_response()
    }
}
