//! JSON-RPC 2.0 envelope types and error codes

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// One admin request
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,

    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(default)]
    pub params: Value,
}

/// RPC-level failure reported back to the admin client
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "invalid request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// Response envelope: always `jsonrpc`, `id`, and one of `result`/`error`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,

    pub id: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parsing() {
        let request: Request = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "id": 1, "method": "stop", "params": {"job_id": 7}}"#,
        )
        .unwrap();
        assert_eq!(request.method, "stop");
        assert_eq!(request.id, json!(1));
        assert_eq!(request.params["job_id"], json!(7));
    }

    #[test]
    fn test_response_envelope_shape() {
        let ok = Response::result(json!("abc"), json!({"jobs": 3}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains(r#""jsonrpc":"2.0""#));
        assert!(text.contains(r#""result""#));
        assert!(!text.contains(r#""error""#));

        let err = Response::error(json!(2), RpcError::invalid_params("missing job_id"));
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains(r#""error""#));
        assert!(text.contains("-32602"));
        assert!(!text.contains(r#""result""#));
    }
}
