//! Error types for the control plane and JSON error responses for the dispatch API

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;

use crate::resources::NamespacedName;

/// Errors returned by the token bucket limiter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimiterError {
    /// More tokens were requested than the bucket can ever hold
    #[error("requested {requested} tokens exceeds limiter burst {burst}")]
    ExceedsBurst { requested: u32, burst: u32 },
    /// The tokens cannot be made available within the allowed wait
    #[error("rate limit would require waiting longer than {max_wait:?}")]
    WouldExceedWait { max_wait: Duration },
    /// The cancellation token fired before the tokens became available
    #[error("wait cancelled")]
    Cancelled,
}

/// Errors reported by an external resource source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The resource version a watch was started from is no longer available
    #[error("resource version {0} expired, relist required")]
    Expired(String),
    /// The source could not be reached or returned garbage
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Transient reconciliation failures. Every variant is retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Some ingresses could not be converted, usually because a referenced
    /// service is not cached yet
    #[error("failed to convert {} ingress(es): {}", .0.len(), format_failures(.0))]
    Conversion(Vec<ConversionFailure>),
    /// The snapshot could not be encoded for dispatch
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single ingress that was left out of a snapshot
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{ingress}: {reason}")]
pub struct ConversionFailure {
    pub ingress: NamespacedName,
    pub reason: String,
}

fn format_failures(failures: &[ConversionFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a dispatch target refused a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    /// The target's outbound buffer is full; it fell too far behind
    #[error("target buffer is full")]
    Full,
    /// The target has gone away
    #[error("target is closed")]
    Closed,
}

/// Errors from a single receiver connection attempt
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("invalid dispatch url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect to dispatcher: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("dispatcher responded with status {0}")]
    Status(StatusCode),
    #[error("dispatch stream failed: {0}")]
    Stream(#[from] hyper::Error),
}

/// Error codes for dispatch API errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchErrorCode {
    /// No handler for the requested path
    NotFound,
    /// Path exists but the method is not supported
    MethodNotAllowed,
    /// The dispatcher is shutting down and refuses new subscribers
    ShuttingDown,
}

impl DispatchErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchErrorCode::NotFound => StatusCode::NOT_FOUND,
            DispatchErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DispatchErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Ingressgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DispatchErrorCode::NotFound => "NOT_FOUND",
            DispatchErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            DispatchErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: DispatchErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: DispatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Ingressgate-Error header
pub fn json_error_response(
    code: DispatchErrorCode,
    message: impl Into<String>,
) -> Response<UnsyncBoxBody<Bytes, Infallible>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Ingressgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).boxed_unsync())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(DispatchErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            DispatchErrorCode::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            DispatchErrorCode::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(DispatchErrorCode::NotFound, "no route for /nope");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"no route for /nope\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(DispatchErrorCode::ShuttingDown, "going away");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Ingressgate-Error").unwrap(),
            "SHUTTING_DOWN"
        );
    }

    #[test]
    fn test_limiter_error_messages() {
        let err = LimiterError::ExceedsBurst {
            requested: 5,
            burst: 2,
        };
        assert_eq!(err.to_string(), "requested 5 tokens exceeds limiter burst 2");
        assert_eq!(LimiterError::Cancelled.to_string(), "wait cancelled");
    }

    #[test]
    fn test_conversion_error_lists_ingresses() {
        let err = ReconcileError::Conversion(vec![ConversionFailure {
            ingress: NamespacedName::new("default", "web"),
            reason: "service default/api not found".to_string(),
        }]);
        let message = err.to_string();
        assert!(message.contains("1 ingress(es)"));
        assert!(message.contains("default/web: service default/api not found"));
    }
}
