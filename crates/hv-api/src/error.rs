use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hv_infra::Error as InfraError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Infra(#[from] InfraError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let ApiError::Infra(e) = self else {
            return StatusCode::NOT_FOUND;
        };
        match e {
            InfraError::Validation(_) => StatusCode::BAD_REQUEST,
            InfraError::ProviderNotFound(_) | InfraError::EntityNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            InfraError::ProviderDisabled(_) | InfraError::AlreadyExists(_) => StatusCode::CONFLICT,
            InfraError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            InfraError::BuildFailed { .. }
            | InfraError::TaskFailed { .. }
            | InfraError::Prism(_)
            | InfraError::Vmware(_) => StatusCode::BAD_GATEWAY,
            InfraError::TaskTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            InfraError::Config(_) | InfraError::Io(_) | InfraError::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
