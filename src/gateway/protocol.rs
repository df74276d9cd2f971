//! Gateway Wire Protocol
//!
//! Single responsibility: JSON frame encoding/decoding.
//!
//! Three frame kinds share one envelope:
//!
//! ```text
//! {"type":"req", "id":"…", "method":"…", "params":{…}}
//! {"type":"res", "id":"…", "ok":true,  "payload":{…}}
//! {"type":"res", "id":"…", "ok":false, "error":{"message":"…"}}
//! {"type":"evt", "event":"connect.challenge", "payload":{"nonce":"…"}}
//! ```
//!
//! `type` is matched case-insensitively and accepts `request`, `response`
//! and `event` as synonyms. Frames that don't fit are dropped, not errors.

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::clean_str;
use crate::error::GatewayError;

/// Gateway protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

/// Event the gateway pushes before accepting a device-signed connect.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Intermediate status that does not complete an `expect_final` call.
pub const ACCEPTED_STATUS: &str = "accepted";

/// Error code for a connect that must be retried with a nonce.
pub const NONCE_REQUIRED_CODE: &str = "DEVICE_NONCE_REQUIRED";

const NONCE_REQUIRED_MESSAGE: &str = "device nonce required";

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Response(ResponseFrame),
    Event {
        event: String,
        payload: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    pub payload: Option<Value>,
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorShape {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl Frame {
    /// Decode a text frame. Returns `None` for anything that isn't a usable frame.
    pub fn parse(text: &str) -> Option<Frame> {
        let value: Value = serde_json::from_str(text).ok()?;
        let kind = value.get("type").and_then(Value::as_str).map(|t| clean_str(t, 32).to_lowercase())?;

        match kind.as_str() {
            "req" | "request" => Some(Frame::Request {
                id: value.get("id")?.as_str()?.to_string(),
                method: value.get("method")?.as_str()?.to_string(),
                params: value.get("params").cloned().unwrap_or_else(|| json!({})),
            }),
            "res" | "response" => {
                let error = value.get("error").filter(|e| !e.is_null()).map(|e| ErrorShape {
                    code: e.get("code").and_then(Value::as_str).map(str::to_string),
                    message: e.get("message").and_then(Value::as_str).map(str::to_string),
                });
                Some(Frame::Response(ResponseFrame {
                    id: value.get("id")?.as_str()?.to_string(),
                    ok: value.get("ok").is_some_and(truthy),
                    payload: value.get("payload").filter(|p| !p.is_null()).cloned(),
                    error,
                }))
            }
            "evt" | "event" => Some(Frame::Event {
                event: value.get("event")?.as_str()?.to_string(),
                payload: value.get("payload").filter(|p| !p.is_null()).cloned(),
            }),
            _ => None,
        }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> String {
        match self {
            Frame::Request { id, method, params } => {
                json!({ "type": "req", "id": id, "method": method, "params": params })
            }
            Frame::Response(res) => {
                let mut frame = json!({ "type": "res", "id": res.id, "ok": res.ok });
                if let Some(payload) = &res.payload {
                    frame["payload"] = payload.clone();
                }
                if let Some(error) = &res.error {
                    let mut shape = json!({});
                    if let Some(code) = &error.code {
                        shape["code"] = json!(code);
                    }
                    if let Some(message) = &error.message {
                        shape["message"] = json!(message);
                    }
                    frame["error"] = shape;
                }
                frame
            }
            Frame::Event { event, payload } => {
                let mut frame = json!({ "type": "evt", "event": event });
                if let Some(payload) = payload {
                    frame["payload"] = payload.clone();
                }
                frame
            }
        }
        .to_string()
    }

    /// Build a request frame with serializable params.
    pub fn request<P: Serialize>(id: &str, method: &str, params: &P) -> Result<Frame, GatewayError> {
        Ok(Frame::Request {
            id: id.to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })
    }

    /// Nonce carried by a `connect.challenge` event, if this is one.
    pub fn challenge_nonce(&self) -> Option<Option<String>> {
        match self {
            Frame::Event { event, payload } if event == CHALLENGE_EVENT => Some(
                payload
                    .as_ref()
                    .and_then(|p| p.get("nonce"))
                    .and_then(Value::as_str)
                    .map(|n| clean_str(n, 512))
                    .filter(|n| !n.is_empty()),
            ),
            _ => None,
        }
    }
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: None,
                message: Some(message.to_string()),
            }),
        }
    }

    /// `payload.status`, if it is a string.
    pub fn status(&self) -> Option<&str> {
        self.payload.as_ref()?.get("status")?.as_str()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref()?.message.as_deref()
    }

    /// True when the gateway refused a connect only because no nonce was signed.
    ///
    /// The message match mirrors the gateway's current wording and is kept
    /// until every gateway in the field sends the error code.
    pub fn is_nonce_required(&self) -> bool {
        let Some(error) = &self.error else {
            return false;
        };
        let by_code = error
            .code
            .as_deref()
            .is_some_and(|code| code.eq_ignore_ascii_case(NONCE_REQUIRED_CODE));
        let by_message = error
            .message
            .as_deref()
            .is_some_and(|msg| msg.to_lowercase().contains(NONCE_REQUIRED_MESSAGE));
        by_code || by_message
    }
}

/// Params of the `connect` handshake request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub caps: Vec<String>,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<TokenAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceProof>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenAuth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// JSON truthiness: `null`, `false`, `0` and `""` are false.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_synonyms_case_insensitive() {
        let res = Frame::parse(r#"{"type":"RESPONSE","id":"a","ok":true,"payload":{"x":1}}"#).unwrap();
        assert!(matches!(res, Frame::Response(ref r) if r.ok && r.id == "a"));

        let evt = Frame::parse(r#"{"type":" Event ","event":"connect.challenge","payload":{"nonce":"n1"}}"#).unwrap();
        assert_eq!(evt.challenge_nonce(), Some(Some("n1".to_string())));

        let req = Frame::parse(r#"{"type":"request","id":"r","method":"ping"}"#).unwrap();
        assert_eq!(
            req,
            Frame::Request { id: "r".into(), method: "ping".into(), params: json!({}) }
        );
    }

    #[test]
    fn test_parse_ok_flag_truthiness() {
        let ok = |raw: &str| match Frame::parse(raw) {
            Some(Frame::Response(r)) => r.ok,
            other => panic!("unexpected frame: {:?}", other),
        };
        assert!(ok(r#"{"type":"res","id":"a","ok":true}"#));
        assert!(ok(r#"{"type":"res","id":"a","ok":1}"#));
        assert!(ok(r#"{"type":"res","id":"a","ok":"yes"}"#));
        assert!(!ok(r#"{"type":"res","id":"a","ok":0}"#));
        assert!(!ok(r#"{"type":"res","id":"a","ok":""}"#));
        assert!(!ok(r#"{"type":"res","id":"a","ok":null}"#));
        assert!(!ok(r#"{"type":"res","id":"a"}"#));
    }

    #[test]
    fn test_parse_drops_unusable_frames() {
        assert!(Frame::parse("not json").is_none());
        assert!(Frame::parse(r#"{"type":"res","id":7,"ok":true}"#).is_none());
        assert!(Frame::parse(r#"{"type":"hello"}"#).is_none());
        assert!(Frame::parse(r#"{"id":"a","ok":true}"#).is_none());
    }

    #[test]
    fn test_missing_ok_is_failure() {
        let Some(Frame::Response(res)) = Frame::parse(r#"{"type":"res","id":"a"}"#) else {
            panic!("expected response");
        };
        assert!(!res.ok);
        assert!(res.error_message().is_none());
    }

    #[test]
    fn test_challenge_without_nonce() {
        let evt = Frame::parse(r#"{"type":"evt","event":"connect.challenge"}"#).unwrap();
        assert_eq!(evt.challenge_nonce(), Some(None));

        let other = Frame::parse(r#"{"type":"evt","event":"tick","payload":{"nonce":"x"}}"#).unwrap();
        assert_eq!(other.challenge_nonce(), None);
    }

    #[test]
    fn test_nonce_required_detection() {
        assert!(ResponseFrame::err("c", "Device Nonce Required for v3").is_nonce_required());
        assert!(!ResponseFrame::err("c", "invalid token").is_nonce_required());

        let coded = ResponseFrame {
            error: Some(ErrorShape { code: Some("device_nonce_required".into()), message: None }),
            ..ResponseFrame::err("c", "")
        };
        assert!(coded.is_nonce_required());
        assert!(!ResponseFrame::ok("c", json!({})).is_nonce_required());
    }

    #[test]
    fn test_encode_request_and_response() {
        let req = Frame::request("id-1", "cron.run", &json!({ "id": "job" })).unwrap();
        let encoded: Value = serde_json::from_str(&req.encode()).unwrap();
        assert_eq!(encoded, json!({ "type": "req", "id": "id-1", "method": "cron.run", "params": { "id": "job" } }));

        let res = Frame::Response(ResponseFrame::err("id-1", "boom"));
        assert_eq!(Frame::parse(&res.encode()), Some(res));
    }

    #[test]
    fn test_connect_params_shape() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: "gateway-client".into(),
                display_name: "Mission Control Backend".into(),
                version: "1.0.0".into(),
                platform: "linux".into(),
                mode: "backend".into(),
                instance_id: "inst".into(),
            },
            caps: vec![],
            role: "operator".into(),
            scopes: vec!["operator.admin".into()],
            auth: None,
            device: Some(DeviceProof {
                id: "dev".into(),
                public_key: "pk".into(),
                signature: "sig".into(),
                signed_at: 5,
                nonce: None,
            }),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["minProtocol"], 3);
        assert_eq!(value["client"]["displayName"], "Mission Control Backend");
        assert_eq!(value["client"]["instanceId"], "inst");
        assert_eq!(value["device"]["signedAt"], 5);
        assert_eq!(value["device"]["publicKey"], "pk");
        assert!(value.get("auth").is_none());
        assert!(value["device"].get("nonce").is_none());
    }
}
