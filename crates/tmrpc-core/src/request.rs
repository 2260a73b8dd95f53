//! JSON-RPC 2.0 wire types and inbound frame classification.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RpcError;

/// JSON-RPC request ID — string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    /// The numeric correlation key, if this id carries one.
    ///
    /// Event frames echo the subscribe id as `"<n>#event"`, which also
    /// resolves to `n`.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.split('#').next().and_then(|n| n.parse().ok()),
            Self::Null => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// Named request parameters, as the node expects them.
pub type RpcParams = Map<String, Value>;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    pub params: RpcParams,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: RpcParams) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(id),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({data})")?;
        }
        Ok(())
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// The outcome carried by a response: either a result or a node error.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Success(Value),
    Failure(JsonRpcError),
}

impl JsonRpcResponse {
    /// Returns `true` if this is a successful response (no error object).
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn payload(self) -> ResponsePayload {
        match self.error {
            Some(err) => ResponsePayload::Failure(err),
            None => ResponsePayload::Success(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Unwrap the result value or return the node's error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.payload() {
            ResponsePayload::Success(v) => Ok(v),
            ResponsePayload::Failure(e) => Err(e),
        }
    }
}

/// An event pushed by the node for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The query the node matched this event against.
    pub query: String,
    /// Typed event payload, usually `{"type": ..., "value": ...}`.
    pub data: Value,
    /// Composite-key attributes (`tm.event`, `tx.height`, ...).
    #[serde(default)]
    pub events: HashMap<String, Vec<String>>,
}

impl Event {
    /// The `type` tag of the payload, e.g. `tendermint/event/NewBlock`.
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

/// A classified inbound text frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Response(JsonRpcResponse),
    Event { id: RpcId, event: Event },
}

impl Inbound {
    /// Classify a raw text frame.
    ///
    /// A frame whose `result` object carries both `query` and `data` is an
    /// event; anything else with an `id` and a `result` or `error` is a
    /// response.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        let val: Value = serde_json::from_str(text)
            .map_err(|e| RpcError::Protocol(format!("invalid JSON frame: {e}")))?;

        let is_event = val
            .get("result")
            .and_then(Value::as_object)
            .map(|r| r.contains_key("query") && r.contains_key("data"))
            .unwrap_or(false);

        if is_event {
            let id = val
                .get("id")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| RpcError::Protocol(format!("bad event id: {e}")))?
                .unwrap_or(RpcId::Null);
            let event = serde_json::from_value(val["result"].clone())
                .map_err(|e| RpcError::Protocol(format!("bad event payload: {e}")))?;
            return Ok(Self::Event { id, event });
        }

        if val.get("result").is_none() && val.get("error").is_none() {
            return Err(RpcError::Protocol("frame has neither result nor error".into()));
        }

        serde_json::from_value(val)
            .map(Self::Response)
            .map_err(|e| RpcError::Protocol(format!("bad response frame: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serialization() {
        let mut params = RpcParams::new();
        params.insert("height".into(), json!("10"));
        let req = JsonRpcRequest::new(7, "block", params);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"block\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"height\":\"10\""));
    }

    #[test]
    fn response_into_result_ok() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(1),
            result: Some(json!({"n_peers": "3"})),
            error: None,
        };
        assert!(resp.is_ok());
        assert_eq!(resp.into_result().unwrap()["n_peers"], "3");
    }

    #[test]
    fn response_into_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(1),
            result: None,
            error: Some(JsonRpcError {
                code: -32603,
                message: "Internal error".into(),
                data: None,
            }),
        };
        assert!(!resp.is_ok());
        assert_eq!(resp.into_result().unwrap_err().code, -32603);
    }

    #[test]
    fn event_id_suffix_resolves_to_number() {
        assert_eq!(RpcId::String("12#event".into()).as_number(), Some(12));
        assert_eq!(RpcId::String("abc".into()).as_number(), None);
        assert_eq!(RpcId::Null.as_number(), None);
    }

    #[test]
    fn classify_response_frame() {
        let frame = r#"{"jsonrpc":"2.0","id":3,"result":{}}"#;
        match Inbound::parse(frame).unwrap() {
            Inbound::Response(resp) => assert_eq!(resp.id, RpcId::Number(3)),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_event_frame() {
        let frame = r#"{
            "jsonrpc":"2.0","id":"4#event",
            "result":{
                "query":"tm.event = 'NewBlock'",
                "data":{"type":"tendermint/event/NewBlock","value":{}},
                "events":{"tm.event":["NewBlock"]}
            }
        }"#;
        match Inbound::parse(frame).unwrap() {
            Inbound::Event { id, event } => {
                assert_eq!(id.as_number(), Some(4));
                assert_eq!(event.event_type(), Some("tendermint/event/NewBlock"));
                assert_eq!(event.events["tm.event"], vec!["NewBlock".to_string()]);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn classify_garbage_is_protocol_error() {
        assert!(matches!(Inbound::parse("not json"), Err(RpcError::Protocol(_))));
        assert!(matches!(
            Inbound::parse(r#"{"jsonrpc":"2.0","id":1}"#),
            Err(RpcError::Protocol(_))
        ));
    }
}
