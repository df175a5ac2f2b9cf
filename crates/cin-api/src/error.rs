use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cin_leases::LeaseError;
use cin_registry::RegistryError;
use serde_json::json;
use tracing::error;

/// Error envelope: `{"success": false, "error": .., "details"?: [..]}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Vec<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 400 carrying every collected validation message.
    pub fn validation(details: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Validation failed".into(),
            details,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        use RegistryError::*;

        let status = match &err {
            InvalidInput(_)
            | Validation(_)
            | Overlap { .. }
            | VendorOptionsMissing
            | BviInUse { .. }
            | Duplicate(_) => StatusCode::BAD_REQUEST,
            SwitchNotFound(_) | BviNotFound(_) | SubnetNotFound(_) => StatusCode::NOT_FOUND,
            SwitchHasSubnets { .. } | SubnetIdConflict(_) => StatusCode::CONFLICT,
            KeaSubnetWriteFailed { .. }
            | Kea(_)
            | UnexpectedKeaData(_)
            | Persistence(_)
            | Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        let status = match &err {
            LeaseError::Validation(_) => StatusCode::BAD_REQUEST,
            LeaseError::Kea(_) | LeaseError::UnexpectedKeaData(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), "{}", self.message);
        }

        let mut body = json!({ "success": false, "error": self.message });
        if !self.details.is_empty() {
            body["details"] = json!(self.details);
        }
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
