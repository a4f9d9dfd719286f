//! Wire frames for the three channel variants.
//!
//! All three protocols are textual:
//!
//! ```text
//! document-sync  auth{"accessToken":…}        probe handshake
//!                name:state:correlationId     tagged control lines
//!                <OT frames>                  opaque, data plane
//! presence       {"t":event, …payload}        JSON objects
//! events         {"name":event, …payload}     JSON envelopes
//! both           "ping" / "pong"              heartbeat string literals
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Tag prefix of the document-sync probe handshake frames.
pub const AUTH_TAG: &str = "auth";
/// Client heartbeat payload for the presence and event channels.
pub const PING_FRAME: &str = "\"ping\"";
/// Server heartbeat reply, swallowed by the router before decoding.
pub const PONG_FRAME: &str = "\"pong\"";

/// Build the probe authentication frame: `auth{"accessToken":…}`.
pub fn probe_auth_frame(token: &str) -> String {
    format!("{AUTH_TAG}{}", json!({ "accessToken": token }))
}

/// Classify a frame against the probe tag. `None` for unrelated frames;
/// `Some(true)` when the reply carries the identifying `id` field,
/// `Some(false)` when it does not, meaning authentication was rejected.
pub fn probe_auth_reply(frame: &str) -> Option<bool> {
    let body = frame.strip_prefix(AUTH_TAG)?;
    if !body.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => Some(value.get("id").is_some()),
        Err(_) => Some(false),
    }
}

/// Named authentication envelope for the event channel.
pub fn structured_auth_frame(token: &str, role: &str) -> String {
    json!({ "name": "authenticate", "token": token, "type": role }).to_string()
}

/// True when the frame is the structured handshake's welcome envelope.
pub fn is_welcome_frame(frame: &str) -> bool {
    serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|v| v.get("name").and_then(Value::as_str).map(|n| n == "welcome"))
        .unwrap_or(false)
}

/// The `error` member of a JSON data frame, if present. Such frames are
/// logged and suppressed rather than emitted.
pub fn frame_error(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    value.get("error").map(Value::to_string)
}

/// A control-plane line: an identifier tag, then `:`-separated fields,
/// e.g. `saved:ok:42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLine {
    pub name: String,
    pub args: Vec<String>,
}

impl ControlLine {
    /// Parse a control-shaped frame. `None` when the frame does not start
    /// with an identifier tag followed by the delimiter.
    pub fn parse(frame: &str) -> Option<Self> {
        let (name, rest) = frame.split_once(':')?;
        let mut chars = name.chars();
        let first = chars.next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
        Some(Self {
            name: name.to_owned(),
            args: rest.split(':').map(str::to_owned).collect(),
        })
    }

    pub fn encode(name: &str, args: &[&str]) -> String {
        let mut line = String::from(name);
        for arg in args {
            line.push(':');
            line.push_str(arg);
        }
        line
    }
}

/// Presence-channel data frames: `{"t": event, …payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum PresenceFrame {
    /// A participant joined a room. Carries the full member list when the
    /// server is seeding a newly joined client.
    Join {
        room: String,
        project: u64,
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        members: Option<Vec<Uuid>>,
    },
    /// A participant left a room.
    Leave { room: String, project: u64, id: Uuid },
}

/// Event-channel data frames: `{"name": event, …payload}`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub name: String,
    /// The whole envelope, name included.
    pub payload: Value,
}

impl EventFrame {
    pub fn parse(frame: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(frame).ok()?;
        let name = value.get("name")?.as_str()?.to_owned();
        Some(Self { name, payload: value })
    }

    pub fn encode(name: &str, payload: Value) -> String {
        let mut body = match payload {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("name".into(), Value::String(name.to_owned()));
        Value::Object(body).to_string()
    }
}
