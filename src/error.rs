//! Error types and error responses

use crate::pool::PoolError;
use crate::response::{full_body, HttpResponse};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the machine-readable error code
pub const X_PAYLOAD_ERROR: &str = "x-payload-error";

/// Error codes exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No route matched and no default route exists
    RouteNotFound,
    /// The sandbox process could not be started or reached
    SandboxUnavailable,
    /// The temporary script file could not be written
    ScriptWriteFailed,
    /// The loopback request to the sandbox failed
    SandboxConnectionFailed,
    /// The sandbox did not answer within the request timeout
    SandboxTimeout,
    /// Anything else
    InternalError,
    /// API call without an X-API-Key header
    MissingApiKey,
    /// API call with an unknown key
    InvalidApiKey,
    /// Malformed or incomplete API input
    BadRequest,
    /// Unknown API resource
    NotFound,
    /// Request body above the configured limit
    PayloadTooLarge,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    ///
    /// Script execution failures all surface as 500; the code header tells them apart.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::SandboxUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ScriptWriteFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SandboxConnectionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SandboxTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::MissingApiKey => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidApiKey => StatusCode::FORBIDDEN,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Get the error code as a string for the X-Payload-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ErrorCode::SandboxUnavailable => "SANDBOX_UNAVAILABLE",
            ErrorCode::ScriptWriteFailed => "SCRIPT_WRITE_FAILED",
            ErrorCode::SandboxConnectionFailed => "SANDBOX_CONNECTION_FAILED",
            ErrorCode::SandboxTimeout => "SANDBOX_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::MissingApiKey => "MISSING_API_KEY",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
        }
    }
}

/// JSON error body used by the management API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","message":"{}"}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with the X-Payload-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> HttpResponse {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_PAYLOAD_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a plain-text error response with the X-Payload-Error header
pub fn text_error_response(code: ErrorCode, message: impl Into<String>) -> HttpResponse {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header(X_PAYLOAD_ERROR, code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Failures while provisioning the sandbox process
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no free port in {attempts} attempts starting at {start}")]
    PortExhausted { start: u16, attempts: u32 },

    #[error("probing port {port} failed: {source}")]
    PortProbe {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create sandbox root directory: {0}")]
    RootDirectory(#[source] std::io::Error),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox on port {port} not ready after {waited_ms}ms")]
    Startup { port: u16, waited_ms: u128 },
}

/// Failures while executing one script through the sandbox
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to write script {}: {source}", .path.display())]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid sandbox request: {0}")]
    Request(String),

    #[error("sandbox request failed: {0}")]
    Transport(#[from] PoolError),

    #[error("sandbox did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to read sandbox response: {0}")]
    ResponseBody(#[source] hyper::Error),
}

impl ProxyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProxyError::Sandbox(_) => ErrorCode::SandboxUnavailable,
            ProxyError::ScriptWrite { .. } => ErrorCode::ScriptWriteFailed,
            ProxyError::Request(_) => ErrorCode::InternalError,
            ProxyError::Transport(_) => ErrorCode::SandboxConnectionFailed,
            ProxyError::Timeout(_) => ErrorCode::SandboxTimeout,
            ProxyError::ResponseBody(_) => ErrorCode::SandboxConnectionFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::MissingApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::InvalidApiKey.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ErrorCode::SandboxTimeout.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new(ErrorCode::InvalidApiKey, "Invalid API key").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "INVALID_API_KEY");
        assert_eq!(value["message"], "Invalid API key");
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ErrorCode::MissingApiKey, "API key is missing");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(X_PAYLOAD_ERROR).unwrap(),
            "MISSING_API_KEY"
        );
    }

    #[test]
    fn test_text_error_response() {
        let response = text_error_response(ErrorCode::RouteNotFound, "Route not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(X_PAYLOAD_ERROR).unwrap(),
            "ROUTE_NOT_FOUND"
        );
    }

    #[test]
    fn test_proxy_error_codes() {
        let err = ProxyError::from(SandboxError::Startup { port: 8000, waited_ms: 2000 });
        assert_eq!(err.code(), ErrorCode::SandboxUnavailable);
        assert!(err.to_string().contains("8000"));

        let err = ProxyError::Timeout(Duration::from_secs(60));
        assert_eq!(err.code(), ErrorCode::SandboxTimeout);
    }
}
