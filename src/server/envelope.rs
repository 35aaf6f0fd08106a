//! Unified HTTP response envelope
//!
//! Every `/api` response is `{ success, data?, error?, metadata }`. Error
//! codes map to HTTP status codes in one place so handlers never hand-roll
//! status decisions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NodeNotFound,
    InvalidRequest,
    Conflict,
    Timeout,
    CommandFailed,
    NotAuthenticated,
    PermissionDenied,
    ResourceExhausted,
    InternalError,
}

impl ErrorCode {
    /// The HTTP status this code maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NodeNotFound => StatusCode::NOT_FOUND,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::CommandFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body carried in a failed envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Per-response metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "latencyMillis")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_millis: Option<u64>,
}

impl ResponseMeta {
    fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: Uuid::new_v4().to_string(),
            latency_millis: None,
        }
    }
}

/// The unified response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub metadata: ResponseMeta,
}

impl<T> Envelope<T> {
    /// A successful envelope
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: ResponseMeta::new(),
        }
    }

    /// A failed envelope
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
                details: None,
            }),
            metadata: ResponseMeta::new(),
        }
    }

    /// A failed envelope with structured details
    pub fn err_with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
                details: Some(details),
            }),
            metadata: ResponseMeta::new(),
        }
    }

    /// Stamp the measured handler latency
    pub fn with_latency(mut self, latency_millis: u64) -> Self {
        self.metadata.latency_millis = Some(latency_millis);
        self
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        let status = match &self.error {
            Some(body) => body.code.status(),
            None => StatusCode::OK,
        };
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::NodeNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::InvalidRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            ErrorCode::NotAuthenticated.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorCode::ResourceExhausted.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_ok_envelope_shape() {
        let env = Envelope::ok(serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["x"], 1);
        assert!(json.get("error").is_none());
        assert!(json["metadata"]["requestId"].is_string());
    }

    #[test]
    fn test_err_envelope_shape() {
        let env: Envelope<Value> = Envelope::err(ErrorCode::NodeNotFound, "no such node");
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "NODE_NOT_FOUND");
        assert_eq!(json["error"]["message"], "no such node");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::ok(42u32);
        let text = serde_json::to_string(&env).unwrap();
        let parsed: Envelope<u32> = serde_json::from_str(&text).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.data, Some(42));
    }
}
