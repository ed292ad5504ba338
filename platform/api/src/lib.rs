//! HTTP error vocabulary shared by suite services.
//!
//! Every failure a handler can report maps onto one `ApiError` variant, and
//! each variant renders to exactly one response. Handlers return
//! `ApiResult<T>` and let axum turn the error into the terminal response.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Shared handler result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Context attached to internal errors so operators can trace the failing
/// upstream exchange.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Diagnostic {
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Diagnostic {
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status.as_u16());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized(Option<String>),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden")]
    Forbidden(Option<String>),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("resource not found")]
    NotFound,
    #[error("internal server error")]
    Internal(Box<Diagnostic>),
    /// A caller-supplied error hook already decided the response.
    #[error("handled upstream error (status {})", .0.status())]
    Handled(Response),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Duplicate(_) => "DUPLICATE",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL",
            ApiError::Handled(_) => "HANDLED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Duplicate(_) => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Handled(response) => response.status(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(diagnostic: Diagnostic) -> Self {
        Self::Internal(Box::new(diagnostic))
    }

    /// Detail text that is safe to hand back to the caller.
    fn detail(&self) -> Option<&str> {
        match self {
            ApiError::Unauthorized(detail) | ApiError::Forbidden(detail) => detail.as_deref(),
            ApiError::BadRequest(detail) | ApiError::Duplicate(detail) => Some(detail),
            ApiError::Internal(diagnostic) => Some(&diagnostic.component),
            ApiError::NotFound | ApiError::Handled(_) => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(diagnostic) = &self {
            tracing::error!(
                component = %diagnostic.component,
                status = ?diagnostic.status,
                url = ?diagnostic.url,
                body = ?diagnostic.body,
                "{}",
                diagnostic.message
            );
        }
        let status = self.status();
        let payload = json!({
            "error": self.code(),
            "message": self.to_string(),
            "detail": self.detail(),
        });
        match self {
            ApiError::Handled(response) => response,
            _ => (status, Json(payload)).into_response(),
        }
    }
}
