//! Session registry and connection table
//!
//! The registry is the single owned object every connection task talks to:
//! it keeps the table of live connections, the table of numbered sessions,
//! dispatches `multiplayer` commands, and fans server pushes out to
//! subscribers. Cross-references between connections and sessions are ids
//! in both directions; nothing here holds a pointer into another task.

pub mod session;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ws::protocol::{self, MultiplayerCmd, ObserverKind};

pub use session::{ConnectionId, Session, SessionError};

/// Delay between the host's `prepare` answer and the play transition,
/// giving slower members time to fetch the roster
const PLAY_GRACE: Duration = Duration::from_secs(5);

/// Handle to one live connection. Owned by the registry table; the socket
/// task holds the receiving end of `sender`.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub username: String,
    sender: mpsc::UnboundedSender<Message>,
    observers: Mutex<HashSet<ObserverKind>>,
    /// Sessions this connection is linked to, by id
    sessions: Mutex<Vec<u64>>,
}

impl ConnectionHandle {
    /// Queue a text frame; send failures only mean the socket is gone
    pub fn send_text(&self, frame: String) {
        let _ = self.sender.send(Message::Text(frame));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.sender.send(Message::Binary(data));
    }

    pub fn observer_add(&self, kind: ObserverKind) -> bool {
        self.observers.lock().insert(kind)
    }

    pub fn observer_remove(&self, kind: &ObserverKind) {
        self.observers.lock().remove(kind);
    }

    pub fn has_observer(&self, kind: &ObserverKind) -> bool {
        self.observers.lock().contains(kind)
    }

    fn session_link(&self, id: u64) {
        let mut sessions = self.sessions.lock();
        if !sessions.contains(&id) {
            sessions.push(id);
        }
    }

    fn session_unlink(&self, id: u64) {
        self.sessions.lock().retain(|s| *s != id);
    }

    pub fn session_ids(&self) -> Vec<u64> {
        self.sessions.lock().clone()
    }
}

/// Registry of live connections and multiplayer sessions
pub struct EngineRegistry {
    config: Arc<Config>,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    sessions: DashMap<u64, Arc<Session>>,
    next_session_id: AtomicU64,
}

impl EngineRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Register an authenticated connection. The sender is the queue the
    /// connection's writer task drains; the handle is what every other
    /// task uses to address this peer.
    pub fn register(
        &self,
        username: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4(),
            username: username.to_string(),
            sender,
            observers: Mutex::new(HashSet::new()),
            sessions: Mutex::new(Vec::new()),
        });
        self.connections.insert(handle.id, handle.clone());
        info!(conn_id = %handle.id, username, "Connection registered");
        self.push_peers();
        handle
    }

    /// Full synchronous teardown of a connection: session membership,
    /// host re-election, observers - everything, before the socket task
    /// exits. Leaving any of it "for later" is a stale-host-pointer bug.
    pub fn unregister(&self, conn: &ConnectionHandle) {
        self.connections.remove(&conn.id);

        for session_id in conn.session_ids() {
            let Some(session) = self.session(session_id) else {
                continue;
            };
            let outcome = session.unlink(conn.id);
            if outcome.host_changed {
                // Survivors must learn their new host right away
                self.trigger_session(&session);
            }
        }

        conn.sessions.lock().clear();
        conn.observers.lock().clear();

        info!(conn_id = %conn.id, username = %conn.username, "Connection unregistered");
        self.push_peers();
    }

    /// Observer management for the `add` op. Subscribing re-triggers
    /// immediately so a late joiner sees current state without waiting
    /// for the next tick.
    pub fn observer_add(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, kind: ObserverKind) {
        conn.observer_add(kind.clone());
        debug!(conn_id = %conn.id, ?kind, "Observer added");

        match kind {
            ObserverKind::Peers => self.push_peers_to(conn),
            ObserverKind::Multiplayer => {
                // Watch every live session and push their current state.
                // Watching grants pushes only; membership needs `connect`.
                for entry in self.sessions.iter() {
                    let session = entry.value();
                    session.watch(conn.id);
                    conn.session_link(session.id());
                }
                self.trigger_connection(conn);
            }
        }
    }

    /// Dropping the `multiplayer` observer detaches the watcher links;
    /// membership obtained through `connect` is untouched.
    pub fn observer_remove(&self, conn: &Arc<ConnectionHandle>, kind: ObserverKind) {
        conn.observer_remove(&kind);
        debug!(conn_id = %conn.id, ?kind, "Observer removed");

        if kind == ObserverKind::Multiplayer {
            for session_id in conn.session_ids() {
                let Some(session) = self.session(session_id) else {
                    continue;
                };
                session.detach_watcher(conn.id);
                if !session.is_member(conn.id) {
                    conn.session_unlink(session_id);
                }
            }
        }
    }

    /// Dispatch one `multiplayer` command. Command-level failures go back
    /// inside the multiplayer envelope (`{cmd, error}`), never as a
    /// connection-fatal error.
    pub fn handle_multiplayer(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, cmd: MultiplayerCmd) {
        match cmd {
            MultiplayerCmd::Connect => self.cmd_connect(conn),
            MultiplayerCmd::State => {
                for session_id in conn.session_ids() {
                    if let Some(session) = self.session(session_id) {
                        self.trigger_session(&session);
                    }
                }
            }
            MultiplayerCmd::Start { engine } => {
                let Some(session) = self.resolve(conn, engine, "start") else {
                    return;
                };
                match session.start(conn.id) {
                    Ok(()) => self.trigger_session(&session),
                    Err(e) => send_cmd_error(conn, "start", e),
                }
            }
            MultiplayerCmd::Create { engine, entities } => {
                let Some(session) = self.resolve(conn, engine, "create") else {
                    return;
                };
                let Ok(packed) = STANDARD.decode(entities.as_bytes()) else {
                    send_cmd_error(conn, "create", SessionError::InvalidData);
                    return;
                };
                match session.create(conn.id, &packed) {
                    Ok(count) => {
                        debug!(engine_id = session.id(), entities = count, "Roster created");
                        self.trigger_session(&session);
                    }
                    Err(e) => send_cmd_error(conn, "create", e),
                }
            }
            MultiplayerCmd::Finish { engine } => {
                let Some(session) = self.resolve(conn, engine, "finish") else {
                    return;
                };
                match session.finish(conn.id) {
                    Ok(()) => self.trigger_session(&session),
                    Err(e) => send_cmd_error(conn, "finish", e),
                }
            }
            MultiplayerCmd::Prepare { engine } => {
                let Some(session) = self.resolve(conn, engine, "prepare") else {
                    return;
                };
                match session.prepare(conn.id) {
                    Ok(reply) => {
                        conn.send_text(protocol::multiplayer_frame(json!({
                            "cmd": "prepare",
                            "engine": session.id(),
                            "entities": reply.entities_b64,
                        })));
                        if reply.arm_play {
                            self.arm_play(session);
                        }
                    }
                    Err(e) => send_cmd_error(conn, "prepare", e),
                }
            }
        }
    }

    /// Route a binary snapshot frame to every session the connection is a
    /// member of; watchers have no write access
    pub fn binary_received(&self, conn: &ConnectionHandle, data: &[u8]) {
        for session_id in conn.session_ids() {
            if let Some(session) = self.session(session_id) {
                if session.is_member(conn.id) {
                    session.binary_received(data, &conn.username);
                }
            }
        }
    }

    /// Push the composed state of one session to its members and watchers.
    /// The recipient list is copied under the session lock; the sends
    /// happen outside it.
    pub fn trigger_session(&self, session: &Arc<Session>) {
        for conn_id in session.push_recipient_ids() {
            if let Some(conn) = self.connections.get(&conn_id) {
                let push = session.state_push_for(conn_id);
                conn.send_text(protocol::multiplayer_frame(
                    serde_json::to_value(push).unwrap_or(Value::Null),
                ));
            }
        }
    }

    /// Push the state of every session one connection is linked to
    pub fn trigger_connection(&self, conn: &Arc<ConnectionHandle>) {
        for session_id in conn.session_ids() {
            if let Some(session) = self.session(session_id) {
                let push = session.state_push_for(conn.id);
                conn.send_text(protocol::multiplayer_frame(
                    serde_json::to_value(push).unwrap_or(Value::Null),
                ));
            }
        }
    }

    /// Periodic maintenance: GC probe over all sessions
    pub async fn run_gc(self: Arc<Self>) {
        let threshold = self.config.session_idle_probes();
        let mut probe = tokio::time::interval(self.config.session_probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            probe.tick().await;

            let doomed: Vec<u64> = self
                .sessions
                .iter()
                .filter(|e| e.value().idle_probe(threshold))
                .map(|e| *e.key())
                .collect();

            for id in doomed {
                self.sessions.remove(&id);
                info!(engine_id = id, "Idle session removed");
            }
        }
    }

    /// Server-side replication loop: while a session is playing, render
    /// its pending records and broadcast the packed snapshot each tick.
    pub async fn run_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            for entry in self.sessions.iter() {
                let session = entry.value();
                let Some(packed) = session.render_and_pack() else {
                    continue;
                };
                for conn_id in session.member_ids() {
                    if let Some(conn) = self.connections.get(&conn_id) {
                        conn.send_binary(packed.to_vec());
                    }
                }
            }
        }
    }

    fn cmd_connect(self: &Arc<Self>, conn: &Arc<ConnectionHandle>) {
        // A connection already in a session re-joins it instead of
        // spawning a parallel one
        if let Some(existing) = conn
            .session_ids()
            .into_iter()
            .find_map(|id| self.session(id))
        {
            existing.link(conn.id, &conn.username);
            self.reply_connect(conn, existing.id());
            return;
        }

        // First-fit join: the lowest-numbered joinable session
        let candidate = self
            .sessions
            .iter()
            .filter(|e| e.value().is_joinable())
            .min_by_key(|e| *e.key())
            .map(|e| e.value().clone());

        let session = match candidate {
            Some(session) => {
                session.link(conn.id, &conn.username);
                session
            }
            None => {
                let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                let session = Arc::new(Session::new(
                    id,
                    self.config.tick_interval.as_millis() as u64,
                    conn.id,
                    &conn.username,
                ));
                self.sessions.insert(id, session.clone());
                session
            }
        };

        conn.session_link(session.id());
        info!(conn_id = %conn.id, engine_id = session.id(), "Connected to session");
        self.reply_connect(conn, session.id());
    }

    fn reply_connect(&self, conn: &ConnectionHandle, engine_id: u64) {
        conn.send_text(protocol::multiplayer_frame(json!({
            "cmd": "connect",
            "engine": engine_id,
        })));
    }

    /// Look up a session by id, requiring the caller to be linked to it
    fn resolve(
        &self,
        conn: &Arc<ConnectionHandle>,
        engine: Option<u64>,
        cmd: &str,
    ) -> Option<Arc<Session>> {
        let session = engine
            .and_then(|id| self.session(id))
            .filter(|s| s.is_member(conn.id));
        if session.is_none() {
            warn!(conn_id = %conn.id, ?engine, cmd, "Invalid engine reference");
            conn.send_text(protocol::multiplayer_frame(json!({
                "cmd": cmd,
                "error": "invalid engine",
            })));
        }
        session
    }

    /// Arm the delayed `Preparing -> Playing` transition after the host
    /// fetched the roster
    fn arm_play(self: &Arc<Self>, session: Arc<Session>) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PLAY_GRACE).await;
            if session.play() {
                registry.trigger_session(&session);
            }
        });
    }

    /// Peer-list push to every subscriber of the `peers` stream
    fn push_peers(&self) {
        let frame = protocol::envelope("peers", self.peer_list());
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.has_observer(&ObserverKind::Peers) {
                conn.send_text(frame.clone());
            }
        }
    }

    fn push_peers_to(&self, conn: &ConnectionHandle) {
        conn.send_text(protocol::envelope("peers", self.peer_list()));
    }

    fn peer_list(&self) -> Value {
        let users: Vec<String> = self
            .connections
            .iter()
            .map(|e| e.value().username.clone())
            .collect();
        json!(users)
    }
}

fn send_cmd_error(conn: &ConnectionHandle, cmd: &str, error: SessionError) {
    conn.send_text(protocol::multiplayer_frame(json!({
        "cmd": cmd,
        "error": error.to_string(),
    })));
}
