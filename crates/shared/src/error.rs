//! Shared error types for the event subscription API.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error envelope returned by the backend on non-2xx responses.
///
/// Most handlers send `{"error": "..."}`; the global handler adds
/// `status`, `errorCode` and a `requestId`. Older endpoints use `message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Attempt to parse an error body into a user-facing message.
/// Prefers `error`, falls back to `message`.
pub fn try_error_message(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    [parsed.error, parsed.message]
        .into_iter()
        .flatten()
        .find(|m| !m.trim().is_empty())
}

/// Fixed error taxonomy keyed by HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ValidationError,
    RateLimited,
    InternalError,
    BadGateway,
    ServiceUnavailable,
    ServerError,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorCode::BadRequest,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::Conflict,
            422 => ErrorCode::ValidationError,
            429 => ErrorCode::RateLimited,
            500 => ErrorCode::InternalError,
            502 => ErrorCode::BadGateway,
            503 => ErrorCode::ServiceUnavailable,
            _ => ErrorCode::ServerError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::BadGateway => "BAD_GATEWAY",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ServerError => "SERVER_ERROR",
        }
    }

    /// Message used when the response body carries none.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "Invalid request. Please check your input.",
            ErrorCode::Unauthorized => "Authentication required. Please log in.",
            ErrorCode::Forbidden => "You do not have permission to perform this action.",
            ErrorCode::NotFound => "The requested resource was not found.",
            ErrorCode::Conflict => "The request conflicts with the current state.",
            ErrorCode::ValidationError => "Validation failed. Please check your input.",
            ErrorCode::RateLimited => "Too many requests. Please try again later.",
            ErrorCode::InternalError => "Internal server error. Please try again later.",
            ErrorCode::BadGateway => "Bad gateway. The server is temporarily unavailable.",
            ErrorCode::ServiceUnavailable => "Service unavailable. Please try again later.",
            ErrorCode::ServerError => "Server error. Please try again later.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API error type for client-side use
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No response was received (connect, DNS, timeout).
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status} {code}: {message}")]
    Http {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    /// Anything else, e.g. an undecodable response body.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Build an HTTP error from a status and raw response body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let code = ErrorCode::from_status(status);
        let message = try_error_message(body).unwrap_or_else(|| code.default_message().to_string());
        ApiError::Http { status, code, message }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ApiError::Http { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(400..=499))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(500..=599))
    }

    /// Message suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Network(_) => {
                "Network error. Please check your connection and try again.".to_string()
            }
            ApiError::Http { message, .. } => message.clone(),
            ApiError::Unknown(msg) => msg.clone(),
        }
    }
}
