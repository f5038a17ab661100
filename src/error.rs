use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// API-surface error. The failure categories the core distinguishes map onto
/// these variants: scheduling failure → `ServiceUnavailable`, state conflicts
/// → `Conflict`, auth failures → `Unauthorized`/`Forbidden`, transport and
/// store failures → `Internal` (fail closed).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": "forbidden" }),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            Self::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            Self::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": msg }),
            ),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".into()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    Self::Conflict("resource already exists".into())
                } else {
                    tracing::error!(error = %err, "database error");
                    Self::Internal(err.into())
                }
            }
            _ => {
                tracing::error!(error = %err, "database error");
                Self::Internal(err.into())
            }
        }
    }
}

impl From<fred::error::Error> for ApiError {
    fn from(err: fred::error::Error) -> Self {
        tracing::error!(error = %err, "valkey error");
        Self::Internal(err.into())
    }
}

impl From<crate::dispatch::DispatchError> for ApiError {
    fn from(err: crate::dispatch::DispatchError) -> Self {
        use crate::dispatch::DispatchError;
        match err {
            DispatchError::NoAvailableAgent { platform, region } => {
                let scope = region.map_or_else(|| platform.clone(), |r| format!("{platform}/{r}"));
                Self::ServiceUnavailable(format!("no available agent for {scope}"))
            }
            DispatchError::SessionNotFound => Self::NotFound("session".into()),
            DispatchError::InvalidState(msg) => Self::Conflict(msg),
            DispatchError::UnknownTemplate(name) => {
                Self::BadRequest(format!("unknown template: {name}"))
            }
            DispatchError::Database(e) => e.into(),
            DispatchError::Other(e) => Self::Internal(e),
        }
    }
}
