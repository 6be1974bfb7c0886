//! Control-channel protocol
//!
//! Every control frame is a JSON object `{op, d}`. During authentication
//! the client piggybacks a top-level `token` field on its first frame.
//! Binary frames carry compressed snapshots and never use this envelope.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Inbound control frame
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub d: Value,
    /// Credential token, required until the connection is authenticated
    #[serde(default)]
    pub token: Option<String>,
}

/// Session game state as observed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    Connecting,
    Creating,
    Preparing,
    Playing,
    Finished,
}

/// `multiplayer` op payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum MultiplayerCmd {
    /// Join an existing session or create a new one as host
    Connect,
    /// Re-push the composed session state to every subscriber
    State,
    /// Host: `Connecting -> Creating`
    Start {
        #[serde(default)]
        engine: Option<u64>,
    },
    /// Host: install the initial entity roster (base64 compressed snapshot)
    Create {
        #[serde(default)]
        engine: Option<u64>,
        #[serde(default)]
        entities: String,
    },
    /// Request the current roster; host answer arms the play transition
    Prepare {
        #[serde(default)]
        engine: Option<u64>,
    },
    /// Host: end the session; it stops accepting members
    Finish {
        #[serde(default)]
        engine: Option<u64>,
    },
}

/// `add` / `remove` observer descriptor
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A connection's registered interest in a class of server pushes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObserverKind {
    Peers,
    Multiplayer,
}

impl ObserverKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "peers" => Some(ObserverKind::Peers),
            "multiplayer" => Some(ObserverKind::Multiplayer),
            _ => None,
        }
    }
}

/// `timeSync` request payload
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSyncReq {
    pub client_time: u64,
}

/// `timeSync` reply payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSyncReply {
    pub client_time: u64,
    pub server_time: u64,
}

/// Composed session state, pushed to every subscriber on trigger.
/// `host` is computed per recipient.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePush {
    pub cmd: &'static str,
    pub engine: u64,
    pub game_state: GameState,
    pub host: bool,
    /// Tick interval in milliseconds
    pub interval: u64,
    /// Member usernames in join order
    pub users: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<i64>,
}

/// Serialize an `{op, d}` envelope
pub fn envelope(op: &str, d: Value) -> String {
    json!({ "op": op, "d": d }).to_string()
}

/// `{op:"error", d:"<message>"}`
pub fn error_frame(message: &str) -> String {
    envelope("error", Value::String(message.to_string()))
}

/// `{op:"hello", d:{versionMajor, versionMinor}}`, pushed on connect
pub fn hello_frame() -> String {
    envelope(
        "hello",
        json!({
            "versionMajor": env!("CARGO_PKG_VERSION_MAJOR").parse::<u32>().unwrap_or(0),
            "versionMinor": env!("CARGO_PKG_VERSION_MINOR").parse::<u32>().unwrap_or(0),
        }),
    )
}

/// `{op:"multiplayer", d:...}` reply/push
pub fn multiplayer_frame(d: Value) -> String {
    envelope("multiplayer", d)
}
