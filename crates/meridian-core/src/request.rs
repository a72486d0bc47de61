//! Opaque completion request and response envelopes
//!
//! The router never inspects the payload; it only moves it between the
//! caller and the endpoint adapter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A logical completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Provider-independent body, interpreted only by the adapter
    pub payload: serde_json::Value,
    /// Free-form attributes forwarded to the adapter
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CompletionRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The adapter's answer to a [`CompletionRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub payload: serde_json::Value,
    /// Name of the endpoint that produced this response (filled in by the router)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CompletionResponse {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            served_by: None,
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_metadata_builder() {
        let request = CompletionRequest::new(json!({"prompt": "hi"}))
            .with_metadata("tenant", "acme")
            .with_metadata("trace", "abc");

        assert_eq!(request.metadata.get("tenant").unwrap(), "acme");
        assert_eq!(request.metadata.len(), 2);
    }

    #[test]
    fn test_response_served_by_is_omitted_when_unset() {
        let response = CompletionResponse::new(json!({"text": "hello"}));
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(!encoded.contains("served_by"));

        let decoded: CompletionResponse =
            serde_json::from_str(r#"{"payload":{"text":"hello"}}"#).unwrap();
        assert_eq!(decoded, response);
    }
}
