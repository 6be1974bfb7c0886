//! WebSocket connection handler
//!
//! One task per socket. The read loop drives the per-connection state
//! machine (`Invalid -> HelloSent -> Authenticated -> Error`); a writer
//! task drains the outbound queue so fan-out from other tasks never
//! touches the socket directly. Whatever goes wrong here stays on this
//! connection: the reply is a typed error frame, never a panic.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::auth;
use crate::engine::ConnectionHandle;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{
    self, Envelope, MultiplayerCmd, ObserverKind, ObserverSpec, TimeSyncReply, TimeSyncReq,
};

/// How long an errored connection may linger before the server closes it
const ERROR_GRACE: Duration = Duration::from_secs(5);

/// Per-connection protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Invalid,
    HelloSent,
    Authenticated,
    Error,
}

/// WebSocket upgrade handler. Authentication happens in-protocol after
/// the hello push, not at upgrade time.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    debug!("New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: outbound queue -> socket. Everything this connection
    // ever sends goes through the queue, including the hello below.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(Message::Text(protocol::hello_frame()));

    let mut stream_state = StreamState::HelloSent;
    let mut conn: Option<Arc<ConnectionHandle>> = None;
    let rate_limiter = ConnectionRateLimiter::new();

    loop {
        // An errored connection gets a bounded grace period, then the
        // server closes it
        let next = if stream_state == StreamState::Error {
            match tokio::time::timeout(ERROR_GRACE, ws_stream.next()).await {
                Ok(next) => next,
                Err(_) => break,
            }
        } else {
            ws_stream.next().await
        };

        let Some(result) = next else {
            break;
        };

        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_control() {
                    warn!("Rate limited control message");
                    continue;
                }
                if !handle_text(&state, &tx, &mut stream_state, &mut conn, &text) {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                if !rate_limiter.check_snapshot() {
                    warn!("Rate limited snapshot frame");
                    continue;
                }
                match (&conn, stream_state) {
                    (Some(conn), StreamState::Authenticated) => {
                        state.registry.binary_received(conn, &data);
                    }
                    _ => {
                        let _ = tx.send(Message::Text(protocol::error_frame("unauthorized")));
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Client initiated close");
                break;
            }
            Err(e) => {
                debug!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Synchronous teardown before this task exits: session membership,
    // host re-election and observers all go now, not "later"
    if let Some(conn) = conn {
        state.registry.unregister(&conn);
    }
    writer.abort();

    debug!("WebSocket connection closed");
}

/// Process one text frame. Returns false when the connection must close.
fn handle_text(
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    stream_state: &mut StreamState,
    conn: &mut Option<Arc<ConnectionHandle>>,
    text: &str,
) -> bool {
    let send = |frame: String| {
        let _ = tx.send(Message::Text(frame));
    };

    if *stream_state == StreamState::Error {
        send(protocol::error_frame("invalid stream"));
        return false;
    }

    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(_) => {
            warn!("Invalid JSON received");
            send(protocol::error_frame("invalid json"));
            return true;
        }
    };

    // Until authenticated, every frame must carry a token
    if *stream_state != StreamState::Authenticated {
        let Some(token) = envelope.token.as_deref() else {
            send(protocol::error_frame("invalid token"));
            *stream_state = StreamState::Error;
            return true;
        };

        match auth::verify(token, &state.config.jwt_secret, state.config.token_not_before) {
            Ok(credential) => {
                info!(username = %credential.username, "Connection authenticated");
                let handle = state.registry.register(&credential.username, tx.clone());
                *conn = Some(handle);
                *stream_state = StreamState::Authenticated;
                send(protocol::envelope(
                    "authenticated",
                    serde_json::Value::String(credential.username),
                ));
            }
            Err(e) => {
                debug!(error = %e, "Token verification failed");
                send(protocol::error_frame("unauthorized"));
                *stream_state = StreamState::Error;
                return true;
            }
        }
    }

    let Some(conn) = conn.as_ref() else {
        // Unreachable in practice: Authenticated implies a handle
        return true;
    };

    let Some(op) = envelope.op.as_deref() else {
        // A bare token frame carries no operation
        return true;
    };

    match op {
        "add" => {
            for spec in parse_observer_specs(&envelope.d) {
                match ObserverKind::parse(&spec.kind) {
                    Some(kind) => state.registry.observer_add(conn, kind),
                    None => warn!(kind = %spec.kind, "Invalid observer"),
                }
            }
        }
        "remove" => {
            for spec in parse_observer_specs(&envelope.d) {
                match ObserverKind::parse(&spec.kind) {
                    Some(kind) => state.registry.observer_remove(conn, kind),
                    None => warn!(kind = %spec.kind, "Invalid observer"),
                }
            }
        }
        "timeSync" => match serde_json::from_value::<TimeSyncReq>(envelope.d.clone()) {
            Ok(req) => {
                let reply = TimeSyncReply {
                    client_time: req.client_time,
                    server_time: unix_millis(),
                };
                send(protocol::envelope(
                    "timeSync",
                    serde_json::to_value(reply).unwrap_or_default(),
                ));
            }
            Err(_) => send(protocol::error_frame("invalid operation")),
        },
        "multiplayer" => match serde_json::from_value::<MultiplayerCmd>(envelope.d.clone()) {
            Ok(cmd) => state.registry.handle_multiplayer(conn, cmd),
            Err(_) => send(protocol::error_frame("invalid operation")),
        },
        other => {
            debug!(op = other, username = %conn.username, "Invalid operation");
            send(protocol::error_frame("invalid operation"));
        }
    }

    true
}

/// `add`/`remove` accept a single descriptor or an array of them
fn parse_observer_specs(d: &serde_json::Value) -> Vec<ObserverSpec> {
    match d {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect(),
        obj @ serde_json::Value::Object(_) => serde_json::from_value(obj.clone())
            .ok()
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}
