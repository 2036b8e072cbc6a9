//! JSON-RPC 2.0 envelope: inbound frame classification and outbound frame builders.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    /// Opening the ledger session or the connection to the node failed.
    SessionFailed,
    EvaluationFailed,
    SubmissionFailed,
    SubscriptionFailed,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::SessionFailed => -32000,
            ErrorCode::EvaluationFailed => -32001,
            ErrorCode::SubmissionFailed => -32002,
            ErrorCode::SubscriptionFailed => -32003,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_cause(mut self, cause: String) -> Self {
        self.data = Some(json!({ "cause": cause }));
        self
    }
}

/// A call from the client. `id` is `None` for notifications, which get no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

/// A reply from the client to one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: Value,
    pub outcome: Result<Value, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Call(Call),
    Reply(Reply),
}

/// Frame that could not be accepted, answered with an error reply keyed to `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: Value,
    pub error: ErrorObject,
}

impl Rejection {
    fn invalid(id: Value, message: &str) -> Self {
        Self {
            id,
            error: ErrorObject::new(ErrorCode::InvalidRequest, message),
        }
    }
}

pub fn classify(text: &str) -> Result<Inbound, Rejection> {
    let value: Value = serde_json::from_str(text).map_err(|err| Rejection {
        id: Value::Null,
        error: ErrorObject::new(ErrorCode::ParseError, format!("parse error: {err}")),
    })?;
    let Value::Object(mut frame) = value else {
        return Err(Rejection::invalid(
            Value::Null,
            "invalid request: expected a single request object",
        ));
    };

    if frame.contains_key("method") {
        return classify_call(frame).map(Inbound::Call);
    }
    if frame.contains_key("result") || frame.contains_key("error") {
        let id = frame.remove("id").unwrap_or(Value::Null);
        let outcome = match frame.remove("error") {
            Some(error) if !error.is_null() => Err(error),
            _ => Ok(frame.remove("result").unwrap_or(Value::Null)),
        };
        return Ok(Inbound::Reply(Reply { id, outcome }));
    }
    let id = frame.remove("id").unwrap_or(Value::Null);
    Err(Rejection::invalid(
        id,
        "invalid request: neither a call nor a reply",
    ))
}

fn classify_call(mut frame: Map<String, Value>) -> Result<Call, Rejection> {
    let id = frame.remove("id");
    let reply_id = id.clone().unwrap_or(Value::Null);
    if frame.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(Rejection::invalid(
            reply_id,
            "invalid request: jsonrpc must be \"2.0\"",
        ));
    }
    let Some(Value::String(method)) = frame.remove("method") else {
        return Err(Rejection::invalid(
            reply_id,
            "invalid request: method must be a string",
        ));
    };
    Ok(Call {
        id,
        method,
        params: frame.remove("params").unwrap_or(Value::Null),
    })
}

pub fn response(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }).to_string()
}

pub fn error_response(id: &Value, error: &ErrorObject) -> String {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error }).to_string()
}

pub fn request(id: &str, method: &str, params: Value) -> String {
    json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "id": id, "params": params })
        .to_string()
}

pub fn notification(method: &str, params: Value) -> String {
    json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "params": params }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(text: &str) -> Rejection {
        classify(text).unwrap_err()
    }

    #[test]
    fn malformed_json_is_parse_error_with_null_id() {
        let rejection = rejected("{not json");
        assert_eq!(rejection.id, Value::Null);
        assert_eq!(rejection.error.code, -32700);
    }

    #[test]
    fn call_with_id_and_params() {
        let inbound = classify(
            r#"{"jsonrpc":"2.0","id":7,"method":"fabric_evaluate","params":{"channel":"c"}}"#,
        )
        .unwrap();
        assert_eq!(
            inbound,
            Inbound::Call(Call {
                id: Some(json!(7)),
                method: "fabric_evaluate".into(),
                params: json!({"channel": "c"}),
            })
        );
    }

    #[test]
    fn call_without_id_is_notification() {
        let Inbound::Call(call) = classify(r#"{"jsonrpc":"2.0","method":"x"}"#).unwrap() else {
            panic!("expected a call");
        };
        assert_eq!(call.id, None);
        assert_eq!(call.params, Value::Null);
    }

    #[test]
    fn call_requires_version_and_string_method() {
        let rejection = rejected(r#"{"id":"a","method":"fabric_evaluate"}"#);
        assert_eq!(rejection.id, json!("a"));
        assert_eq!(rejection.error.code, -32600);

        let rejection = rejected(r#"{"jsonrpc":"2.0","id":3,"method":12}"#);
        assert_eq!(rejection.id, json!(3));
        assert_eq!(rejection.error.code, -32600);
    }

    #[test]
    fn batches_and_scalars_are_invalid_requests() {
        for text in [r#"[{"jsonrpc":"2.0","id":1,"method":"x"}]"#, "42", r#""text""#] {
            let rejection = rejected(text);
            assert_eq!(rejection.id, Value::Null);
            assert_eq!(rejection.error.code, -32600);
        }
        let rejection = rejected(r#"{"jsonrpc":"2.0","id":9}"#);
        assert_eq!(rejection.id, json!(9));
        assert_eq!(rejection.error.code, -32600);
    }

    #[test]
    fn replies_carry_result_or_error() {
        let inbound = classify(r#"{"jsonrpc":"2.0","id":"sig-1","result":{"signature":"AA=="}}"#)
            .unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply(Reply {
                id: json!("sig-1"),
                outcome: Ok(json!({"signature": "AA=="})),
            })
        );

        let inbound =
            classify(r#"{"jsonrpc":"2.0","id":"sig-2","error":{"code":1,"message":"no"}}"#)
                .unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply(Reply {
                id: json!("sig-2"),
                outcome: Err(json!({"code": 1, "message": "no"})),
            })
        );
    }

    #[test]
    fn error_data_is_omitted_without_cause() {
        let plain = ErrorObject::new(ErrorCode::SubmissionFailed, "submission failed");
        let frame: Value = serde_json::from_str(&error_response(&json!(1), &plain)).unwrap();
        assert_eq!(
            frame,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32002, "message": "submission failed"}})
        );

        let detailed = plain.with_cause("timeout".into());
        let frame: Value = serde_json::from_str(&error_response(&json!(1), &detailed)).unwrap();
        assert_eq!(frame["error"]["data"], json!({"cause": "timeout"}));
    }
}
