//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Validation {
        message: String,
        detail: Option<String>,
    },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            detail: None,
        }
    }

    pub fn validation_with_detail(msg: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream { .. } | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Config { .. } | Self::Io(_) | Self::Json(_) | Self::Toml(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing body; the `error` field is stable per category.
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Validation { message, detail } => ErrorBody {
                error: message.clone(),
                detail: detail.clone(),
            },
            Self::Config { message } => ErrorBody::with_detail("Server configuration error", message),
            Self::Upstream { message } => ErrorBody::with_detail("Upstream API error", message),
            Self::Http(e) => ErrorBody::with_detail("Upstream API error", e.to_string()),
            Self::Io(e) => ErrorBody::with_detail("Internal server error", e.to_string()),
            Self::Json(e) => ErrorBody::with_detail("Internal server error", e.to_string()),
            Self::Toml(e) => ErrorBody::with_detail("Internal server error", e.to_string()),
            Self::PayloadTooLarge { .. } => {
                ErrorBody::with_detail("Request body too large", self.to_string())
            }
        }
    }
}

/// Wire shape of every error the gateway produces itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn with_detail(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: Some(detail.into()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
