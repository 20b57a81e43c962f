//! Gateway wire protocol frames.
//!
//! Every frame is a JSON object tagged by `type`: requests carry
//! `{id, method, params}`, responses `{id, ok, payload|error}`, and events are
//! server-initiated pushes a single-shot client simply ignores. One `connect`
//! handshake precedes any request on a connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol versions this client can speak, sent during the handshake.
pub const PROTOCOL_VERSION_MIN: u32 = 1;
pub const PROTOCOL_VERSION_MAX: u32 = 3;

/// Handshake method name.
pub const CONNECT_METHOD: &str = "connect";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        error: Option<WireError>,
    },
    Event {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        event: Option<String>,
        #[serde(default)]
        payload: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Handshake request carrying the protocol range and optional token.
    pub fn connect_request(id: impl Into<String>, token: Option<&str>) -> Self {
        let mut params = serde_json::json!({
            "minProtocolVersion": PROTOCOL_VERSION_MIN,
            "maxProtocolVersion": PROTOCOL_VERSION_MAX,
            "client": format!("steward/{}", env!("CARGO_PKG_VERSION")),
        });
        if let Some(token) = token {
            params["auth"] = serde_json::json!({ "token": token });
        }
        Self::request(id, CONNECT_METHOD, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn req_frame_shape() {
        let frame = Frame::request("r1", "agent.run", json!({"message": "hi"}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["id"], "r1");
        assert_eq!(value["method"], "agent.run");
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn res_frame_parses_with_payload_or_error() {
        let ok: Frame =
            serde_json::from_str(r#"{"type":"res","id":"r1","ok":true,"payload":{"n":1}}"#)
                .unwrap();
        assert!(matches!(ok, Frame::Res { ok: true, .. }));

        let err: Frame = serde_json::from_str(
            r#"{"type":"res","id":"r1","ok":false,"error":{"code":"denied","message":"nope"}}"#,
        )
        .unwrap();
        match err {
            Frame::Res { error, .. } => {
                let error = error.unwrap();
                assert_eq!(error.code.as_deref(), Some("denied"));
                assert_eq!(error.message, "nope");
            }
            _ => panic!("expected res frame"),
        }
    }

    #[test]
    fn event_frame_tolerates_sparse_fields() {
        let event: Frame = serde_json::from_str(r#"{"type":"event","event":"tick"}"#).unwrap();
        assert!(matches!(event, Frame::Event { .. }));
    }

    #[test]
    fn connect_request_carries_protocol_range_and_token() {
        let frame = Frame::connect_request("h1", Some("secret"));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["method"], "connect");
        assert_eq!(value["params"]["minProtocolVersion"], PROTOCOL_VERSION_MIN);
        assert_eq!(value["params"]["maxProtocolVersion"], PROTOCOL_VERSION_MAX);
        assert_eq!(value["params"]["auth"]["token"], "secret");
    }
}
