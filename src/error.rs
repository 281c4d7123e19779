//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Boxed error used for request and response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type returned to clients
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing, malformed or unknown bearer token
    Unauthorized,
    /// Request body exceeds the configured limit
    BodyTooLarge,
    /// No healthy backend with a free slot
    PoolExhausted,
    /// Failed to connect to the selected backend
    ConnectionFailed,
    /// Backend accepted the connection but did not answer in time
    RequestTimeout,
    /// Backend failed after the connection was established
    BadGateway,
    /// The client's request body could not be read
    BadRequest,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::BodyTooLarge => "BODY_TOO_LARGE",
            ProxyErrorCode::PoolExhausted => "POOL_EXHAUSTED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// Failures a request can end in before or while it is proxied
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("failed to read request body: {source}")]
    BodyRead {
        #[source]
        source: BoxError,
    },

    #[error("no healthy backend available")]
    PoolExhausted,

    #[error("failed to connect to backend {backend}: {source}")]
    BackendConnect {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("backend {backend} sent no response within {timeout:?}")]
    BackendTimeout { backend: String, timeout: Duration },

    #[error("backend {backend} failed: {source}")]
    BadGateway {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("response stream from {backend} interrupted: {source}")]
    StreamInterrupted {
        backend: String,
        #[source]
        source: BoxError,
    },
}

impl GatewayError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GatewayError::Unauthorized => ProxyErrorCode::Unauthorized,
            GatewayError::BodyTooLarge { .. } => ProxyErrorCode::BodyTooLarge,
            GatewayError::BodyRead { .. } => ProxyErrorCode::BadRequest,
            GatewayError::PoolExhausted => ProxyErrorCode::PoolExhausted,
            GatewayError::BackendConnect { .. } => ProxyErrorCode::ConnectionFailed,
            GatewayError::BackendTimeout { .. } => ProxyErrorCode::RequestTimeout,
            GatewayError::BadGateway { .. } | GatewayError::StreamInterrupted { .. } => {
                ProxyErrorCode::BadGateway
            }
        }
    }

    /// Message safe to show to clients; backend addresses stay in the logs
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Unauthorized => "Missing or invalid bearer token".to_string(),
            GatewayError::BodyTooLarge { limit } => {
                format!("Request body exceeds the limit of {} bytes", limit)
            }
            GatewayError::BodyRead { .. } => "Failed to read request body".to_string(),
            GatewayError::PoolExhausted => "No backend available, please retry later".to_string(),
            GatewayError::BackendConnect { .. } => "Failed to connect to backend".to_string(),
            GatewayError::BackendTimeout { timeout, .. } => {
                format!("Backend did not respond within {} seconds", timeout.as_secs())
            }
            GatewayError::BadGateway { .. } | GatewayError::StreamInterrupted { .. } => {
                "Backend request failed".to_string()
            }
        }
    }

    /// Convert into the JSON error response sent to the client
    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = json_error_response(self.code(), self.public_message());
        if matches!(self, GatewayError::Unauthorized) {
            response.headers_mut().insert(
                hyper::header::WWW_AUTHENTICATE,
                hyper::header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
