use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coedit_core::ConflictReport;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflicting fields: {}", .0.conflicting_fields.join(", "))]
    Conflict(Box<ConflictReport>),
    #[error("Validation failed: {0}")]
    Unprocessable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<ConflictReport>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }
}

impl From<coedit_core::Error> for AppError {
    fn from(error: coedit_core::Error) -> Self {
        match error {
            coedit_core::Error::NotFound(what) => Self::NotFound(what),
            coedit_core::Error::Conflict(report) => Self::Conflict(report),
            error if error.is_validation() => Self::Unprocessable(error.to_string()),
            error => {
                tracing::error!(error = %error, "Request failed");
                Self::Internal("request could not be completed".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = self.to_string();
        let conflict = match self {
            Self::Conflict(report) => Some(*report),
            _ => None,
        };
        (status, Json(ErrorBody { error, conflict })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use coedit_core::ResourceId;

    use super::*;

    #[test]
    fn core_errors_map_to_status_codes() {
        let cases = [
            (
                AppError::from(coedit_core::Error::NotFound("resource".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(coedit_core::Error::UnknownField {
                    kind: "document".into(),
                    field: "owner".into(),
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AppError::from(coedit_core::Error::Database("disk full".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::bad_request("bad id"), StatusCode::BAD_REQUEST),
            (AppError::unauthorized("no user"), StatusCode::UNAUTHORIZED),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn conflict_maps_to_409() {
        let report = ConflictReport {
            resource_id: ResourceId::new(),
            current_version: 3,
            your_version: 1,
            conflicting_fields: vec!["name".into()],
            current_values: std::iter::once(("name".to_string(), serde_json::json!("x"))).collect(),
            other_active_users: Vec::new(),
        };
        let error = AppError::from(coedit_core::Error::Conflict(Box::new(report)));
        assert!(error.to_string().contains("name"));
        assert_eq!(error.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn internal_errors_hide_details() {
        let error = AppError::from(coedit_core::Error::Database("secret path".into()));
        assert!(!error.to_string().contains("secret path"));
    }
}
