//! HTTP mapping for rejections.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::WWW_AUTHENTICATE},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::identity::IdentityError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("missing payload")]
    MissingPayload,
    /// Absent, malformed or expired bearer token.
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Identity(err) => match err {
                IdentityError::Validation(_) => StatusCode::BAD_REQUEST,
                IdentityError::NotFound(_) => StatusCode::NOT_FOUND,
                IdentityError::Conflict(_) => StatusCode::CONFLICT,
                IdentityError::LockedOut { .. } => StatusCode::LOCKED,
                IdentityError::InvalidCredential => StatusCode::UNAUTHORIZED,
                IdentityError::NotAllowed => StatusCode::FORBIDDEN,
                IdentityError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::MissingPayload => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Identity(IdentityError::Validation(problems)) => json!({
                "error": "validation failed",
                "details": problems,
            }),
            Self::Identity(IdentityError::LockedOut { until }) => json!({
                "error": "locked out",
                "locked_until": until,
            }),
            other => json!({ "error": other.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, Self::Unauthorized) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
