//! One multiplayer session ("engine")
//!
//! A session is the server-side container for one match: its game-state
//! machine, the authoritative entity table seeded by the host, the
//! per-tick buckets of inbound state records, and the host-election rule.
//! All interior state sits behind a single mutex; callers compute fan-out
//! lists under the lock and send outside it.

use std::collections::BTreeMap;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::{self, EntityPhase, EntityRecord};
use crate::util::time::unix_millis;
use crate::ws::protocol::{GameState, StatePush};

/// Connection id, resolved through the registry's connection table.
/// Never a pointer into another task's state.
pub type ConnectionId = Uuid;

/// Entity ids assigned by the server start here
const FIRST_ENTITY_ID: i64 = 1000;

/// Upper bound on the initial roster a host may install
const ROSTER_CAP: usize = 64;

/// Errors reported back inside the `multiplayer` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid state")]
    InvalidState,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid data")]
    InvalidData,
}

/// One member in join order
#[derive(Debug, Clone)]
struct Member {
    id: ConnectionId,
    username: String,
}

/// One row of the authoritative entity table
#[derive(Debug, Clone)]
struct EntityRow {
    /// Username of the peer whose record last drove this entity
    owner: String,
    record: EntityRecord,
}

/// A record waiting to be rendered at its tick
#[derive(Debug, Clone)]
struct PendingRecord {
    sender: String,
    record: EntityRecord,
}

#[derive(Debug)]
struct SessionState {
    game_state: GameState,
    host: Option<ConnectionId>,
    members: Vec<Member>,
    /// Watchers receive state pushes but are not members: never in the
    /// `users` list, never host-eligible
    watchers: Vec<ConnectionId>,
    entities: BTreeMap<i64, EntityRow>,
    next_entity_id: i64,
    /// Inbound records bucketed by tick, drained on every render
    pending: BTreeMap<i64, Vec<PendingRecord>>,
    started_at: Option<u64>,
    started: Option<Instant>,
    idle_probes: u32,
}

/// Outcome of removing a connection from the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkOutcome {
    pub was_member: bool,
    pub host_changed: bool,
    pub now_empty: bool,
}

/// Result of a `prepare` call
pub struct PrepareReply {
    /// Base64 of the full compressed roster
    pub entities_b64: String,
    /// True when the host asked: the caller must arm the delayed play
    pub arm_play: bool,
}

pub struct Session {
    id: u64,
    tick_interval_ms: u64,
    inner: Mutex<SessionState>,
}

impl Session {
    pub fn new(id: u64, tick_interval_ms: u64, host: ConnectionId, username: &str) -> Self {
        info!(engine_id = id, host = %host, username, "Session created");
        Self {
            id,
            tick_interval_ms: tick_interval_ms.max(1),
            inner: Mutex::new(SessionState {
                game_state: GameState::Connecting,
                host: Some(host),
                members: vec![Member {
                    id: host,
                    username: username.to_string(),
                }],
                watchers: Vec::new(),
                entities: BTreeMap::new(),
                next_entity_id: FIRST_ENTITY_ID,
                pending: BTreeMap::new(),
                started_at: None,
                started: None,
                idle_probes: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn game_state(&self) -> GameState {
        self.inner.lock().game_state
    }

    pub fn host(&self) -> Option<ConnectionId> {
        self.inner.lock().host
    }

    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.inner.lock().members.iter().any(|m| m.id == conn)
    }

    /// A session accepts new members until it is finished
    pub fn is_joinable(&self) -> bool {
        self.inner.lock().game_state != GameState::Finished
    }

    /// Member connection ids in join order (the broadcast list)
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().members.iter().map(|m| m.id).collect()
    }

    /// Everyone receiving state pushes: members plus watchers
    pub fn push_recipient_ids(&self) -> Vec<ConnectionId> {
        let state = self.inner.lock();
        state
            .members
            .iter()
            .map(|m| m.id)
            .chain(state.watchers.iter().copied())
            .collect()
    }

    /// Attach a watcher. Membership dominates: a member is never also
    /// listed as a watcher.
    pub fn watch(&self, conn: ConnectionId) {
        let mut state = self.inner.lock();
        if state.members.iter().any(|m| m.id == conn) || state.watchers.contains(&conn) {
            return;
        }
        state.watchers.push(conn);
        debug!(engine_id = self.id, conn_id = %conn, "Watcher attached");
    }

    pub fn detach_watcher(&self, conn: ConnectionId) {
        self.inner.lock().watchers.retain(|w| *w != conn);
    }

    /// Add a connection as a member; re-joining is a no-op. A watcher
    /// that joins is promoted and leaves the watcher list.
    pub fn link(&self, conn: ConnectionId, username: &str) {
        let mut state = self.inner.lock();
        state.idle_probes = 0;
        state.watchers.retain(|w| *w != conn);
        if state.members.iter().any(|m| m.id == conn) {
            return;
        }
        state.members.push(Member {
            id: conn,
            username: username.to_string(),
        });
        debug!(engine_id = self.id, conn_id = %conn, username, "Member linked");
    }

    /// Remove a connection, re-electing the host synchronously if needed.
    /// Called from the disconnect path before the connection task exits;
    /// a deferred election would leave a window with a stale host id.
    pub fn unlink(&self, conn: ConnectionId) -> UnlinkOutcome {
        let mut state = self.inner.lock();

        state.watchers.retain(|w| *w != conn);

        let before = state.members.len();
        state.members.retain(|m| m.id != conn);
        let was_member = state.members.len() != before;

        let mut host_changed = false;
        if state.host == Some(conn) {
            // Promote the first survivor in join order
            match state.members.first() {
                Some(next) => {
                    info!(engine_id = self.id, next_host = %next.id, "Next host elected");
                    state.host = Some(next.id);
                }
                None => {
                    warn!(engine_id = self.id, "Host dismissed, no survivor");
                    state.host = None;
                }
            }
            host_changed = true;
        }

        // An empty session stays alive (and joinable) until the GC probe
        // threshold; a transient reconnect must find its match state intact.
        let now_empty = state.members.is_empty();

        UnlinkOutcome {
            was_member,
            host_changed,
            now_empty,
        }
    }

    /// Host command: `Connecting -> Creating`
    pub fn start(&self, conn: ConnectionId) -> Result<(), SessionError> {
        let mut state = self.inner.lock();
        if state.game_state != GameState::Connecting {
            return Err(SessionError::InvalidState);
        }
        if state.host != Some(conn) {
            return Err(SessionError::PermissionDenied);
        }
        state.game_state = GameState::Creating;
        Ok(())
    }

    /// Host command: install the initial entity roster from a packed
    /// snapshot. Ids are reassigned by the server starting at 1000 and the
    /// tick is forced to zero so every peer starts from the same origin.
    pub fn create(&self, conn: ConnectionId, packed: &[u8]) -> Result<usize, SessionError> {
        let mut state = self.inner.lock();

        if state.game_state != GameState::Connecting && state.game_state != GameState::Creating {
            return Err(SessionError::InvalidState);
        }
        if state.host != Some(conn) {
            return Err(SessionError::PermissionDenied);
        }

        let records = codec::unpack(packed).ok_or(SessionError::InvalidData)?;

        for mut record in records.into_iter().take(ROSTER_CAP) {
            let id = state.next_entity_id;
            state.next_entity_id += 1;

            record.id = id;
            record.tick = 0;
            record.phase = EntityPhase::Active;

            trace!(engine_id = self.id, entity_id = id, "Roster entity added");
            state.entities.insert(
                id,
                EntityRow {
                    owner: String::new(),
                    record,
                },
            );
        }

        let count = state.entities.len();
        state.game_state = GameState::Preparing;
        info!(engine_id = self.id, entities = count, "Roster installed");
        Ok(count)
    }

    /// Any member: fetch the current roster. The host's call arms the
    /// delayed `play` transition.
    pub fn prepare(&self, conn: ConnectionId) -> Result<PrepareReply, SessionError> {
        let state = self.inner.lock();
        if state.game_state != GameState::Preparing {
            return Err(SessionError::InvalidState);
        }

        let packed = pack_entities(&state);
        Ok(PrepareReply {
            entities_b64: STANDARD.encode(&packed),
            arm_play: state.host == Some(conn),
        })
    }

    /// `Preparing -> Playing`; records the tick origin. Returns false when
    /// the state already moved on (a stale timer must not re-fire).
    pub fn play(&self) -> bool {
        let mut state = self.inner.lock();
        if state.game_state != GameState::Preparing {
            return false;
        }
        state.game_state = GameState::Playing;
        state.started_at = Some(unix_millis());
        state.started = Some(Instant::now());
        info!(engine_id = self.id, "Session playing");
        true
    }

    /// Host command: end the session. A finished session accepts no new
    /// members and is collected by the GC once it empties.
    pub fn finish(&self, conn: ConnectionId) -> Result<(), SessionError> {
        let mut state = self.inner.lock();
        if state.game_state == GameState::Finished {
            return Err(SessionError::InvalidState);
        }
        if state.host != Some(conn) {
            return Err(SessionError::PermissionDenied);
        }
        state.game_state = GameState::Finished;
        info!(engine_id = self.id, "Session finished");
        Ok(())
    }

    /// Ticks elapsed since play started
    pub fn current_tick(&self) -> Option<i64> {
        let state = self.inner.lock();
        state
            .started
            .map(|s| (s.elapsed().as_millis() as u64 / self.tick_interval_ms) as i64)
    }

    /// Buffer inbound records for the next render. Frames arriving outside
    /// `Playing` are dropped; "not yet playing" is not an error the sender
    /// can act on.
    pub fn binary_received(&self, data: &[u8], sender: &str) -> usize {
        let mut state = self.inner.lock();

        if state.game_state != GameState::Playing {
            warn!(engine_id = self.id, "Binary message not accepted");
            return 0;
        }

        let Some(records) = codec::unpack(data) else {
            warn!(engine_id = self.id, "Invalid binary message received");
            return 0;
        };

        let mut buffered = 0;
        for record in records {
            let tick = record.tick;
            state.pending.entry(tick).or_default().push(PendingRecord {
                sender: sender.to_string(),
                record,
            });
            buffered += 1;
        }
        buffered
    }

    /// Render pending records into the entity table and produce the packed
    /// snapshot to broadcast. Tick order decides; a record older than what
    /// an entity already carries is discarded (stale-update rejection).
    /// Returns `None` outside `Playing`.
    pub fn render_and_pack(&self) -> Option<Bytes> {
        let mut state = self.inner.lock();

        if state.game_state != GameState::Playing {
            return None;
        }

        let pending = std::mem::take(&mut state.pending);
        for (_tick, bucket) in pending {
            for p in bucket {
                let Some(row) = state.entities.get_mut(&p.record.id) else {
                    // Only host-assigned ids exist server-side
                    continue;
                };
                if p.record.tick < row.record.tick {
                    trace!(
                        engine_id = self.id,
                        entity_id = p.record.id,
                        "Stale record dropped"
                    );
                    continue;
                }
                row.record = p.record;
                row.owner = p.sender;
            }
        }

        Some(pack_entities(&state))
    }

    /// Build the composed state push for one recipient
    pub fn state_push_for(&self, conn: ConnectionId) -> StatePush {
        let state = self.inner.lock();
        StatePush {
            cmd: "state",
            engine: self.id,
            game_state: state.game_state,
            host: state.host == Some(conn),
            interval: self.tick_interval_ms,
            users: state.members.iter().map(|m| m.username.clone()).collect(),
            started_at: state.started_at,
            tick: state
                .started
                .map(|s| (s.elapsed().as_millis() as u64 / self.tick_interval_ms) as i64),
        }
    }

    /// GC probe: a memberless session accumulates idle observations and
    /// becomes deletable once it crosses the threshold. Any member resets
    /// the count, which is what lets a briefly disconnected player come
    /// back without losing match state.
    pub fn idle_probe(&self, threshold: u32) -> bool {
        let mut state = self.inner.lock();
        if state.members.is_empty() {
            state.idle_probes += 1;
        } else {
            state.idle_probes = 0;
        }
        trace!(
            engine_id = self.id,
            idle_probes = state.idle_probes,
            "Session probe"
        );
        state.idle_probes >= threshold
    }
}

/// Stamp table ids onto the records and pack the roster
fn pack_entities(state: &SessionState) -> Bytes {
    let mut records: Vec<EntityRecord> = Vec::with_capacity(state.entities.len());
    for (id, row) in &state.entities {
        let mut record = row.record.clone();
        record.id = *id;
        records.push(record);
    }
    codec::pack(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Vec2;

    fn packed_roster(n: usize) -> Vec<u8> {
        let records: Vec<EntityRecord> = (0..n)
            .map(|i| EntityRecord::soldier(i as i64, 99, Vec2::new(i as f64, 0.0)))
            .collect();
        codec::pack(&records).to_vec()
    }

    #[test]
    fn create_reassigns_ids_and_resets_ticks() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.start(host).unwrap();
        let count = session.create(host, &packed_roster(3)).unwrap();
        assert_eq!(count, 3);
        assert_eq!(session.game_state(), GameState::Preparing);

        let reply = session.prepare(host).unwrap();
        let packed = STANDARD.decode(reply.entities_b64).unwrap();
        let records = codec::unpack(&packed).unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1000, 1001, 1002]);
        assert!(records.iter().all(|r| r.tick == 0));
        assert!(records.iter().all(|r| r.phase == EntityPhase::Active));
    }

    #[test]
    fn create_requires_host_and_state() {
        let host = Uuid::new_v4();
        let other = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.link(other, "bob");

        assert_eq!(
            session.create(other, &packed_roster(1)),
            Err(SessionError::PermissionDenied)
        );

        session.start(host).unwrap();
        session.create(host, &packed_roster(1)).unwrap();
        // Already Preparing
        assert_eq!(
            session.create(host, &packed_roster(1)),
            Err(SessionError::InvalidState)
        );
    }

    #[test]
    fn corrupt_roster_is_invalid_data() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        assert_eq!(
            session.create(host, b"garbage"),
            Err(SessionError::InvalidData)
        );
    }

    #[test]
    fn host_election_follows_join_order() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let session = Session::new(1, 50, a, "a");
        session.link(b, "b");
        session.link(c, "c");

        let outcome = session.unlink(a);
        assert!(outcome.host_changed);
        assert_eq!(session.host(), Some(b));

        let outcome = session.unlink(b);
        assert!(outcome.host_changed);
        assert_eq!(session.host(), Some(c));

        let outcome = session.unlink(c);
        assert!(outcome.host_changed);
        assert_eq!(session.host(), None);
        assert!(outcome.now_empty);
    }

    #[test]
    fn non_host_departure_keeps_host() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let session = Session::new(1, 50, a, "a");
        session.link(b, "b");

        let outcome = session.unlink(b);
        assert!(!outcome.host_changed);
        assert_eq!(session.host(), Some(a));
    }

    #[test]
    fn stale_records_lose_against_newer_ticks() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.start(host).unwrap();
        session.create(host, &packed_roster(1)).unwrap();
        session.prepare(host).unwrap();
        assert!(session.play());

        let entity = 1000;
        let newer = EntityRecord {
            position: Vec2::new(10.0, 0.0),
            ..EntityRecord::soldier(entity, 10, Vec2::default())
        };
        let stale = EntityRecord {
            position: Vec2::new(99.0, 0.0),
            ..EntityRecord::soldier(entity, 7, Vec2::default())
        };

        session.binary_received(&codec::pack(&[newer.clone()]), "alice");
        session.binary_received(&codec::pack(&[stale]), "bob");

        let packed = session.render_and_pack().unwrap();
        let records = codec::unpack(&packed).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tick, 10);
        assert_eq!(records[0].position, Vec2::new(10.0, 0.0));
    }

    #[test]
    fn binary_frames_outside_playing_are_dropped() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        let frame = codec::pack(&[EntityRecord::soldier(1000, 1, Vec2::default())]);
        assert_eq!(session.binary_received(&frame, "alice"), 0);
    }

    #[test]
    fn prepare_outside_preparing_is_invalid_state() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        assert!(matches!(
            session.prepare(host),
            Err(SessionError::InvalidState)
        ));
    }

    #[test]
    fn stale_play_timer_does_not_refire() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.start(host).unwrap();
        session.create(host, &packed_roster(1)).unwrap();
        session.prepare(host).unwrap();
        assert!(session.play());
        assert!(!session.play());
    }

    #[test]
    fn watchers_get_pushes_but_no_membership_or_host_claim() {
        let host = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.watch(watcher);

        assert!(!session.is_member(watcher));
        assert!(session.push_recipient_ids().contains(&watcher));
        assert!(!session.member_ids().contains(&watcher));

        // The host leaving must not promote a watcher
        let outcome = session.unlink(host);
        assert!(outcome.host_changed);
        assert_eq!(session.host(), None);
        assert!(outcome.now_empty);
    }

    #[test]
    fn detached_watcher_leaves_the_fanout_list() {
        let host = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.watch(watcher);
        session.detach_watcher(watcher);
        assert!(!session.push_recipient_ids().contains(&watcher));
    }

    #[test]
    fn joining_promotes_a_watcher_without_duplicating_fanout() {
        let host = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.watch(watcher);
        session.link(watcher, "bob");

        assert!(session.is_member(watcher));
        let recipients = session.push_recipient_ids();
        assert_eq!(recipients.iter().filter(|id| **id == watcher).count(), 1);
    }

    #[test]
    fn finish_is_host_only_and_terminal() {
        let host = Uuid::new_v4();
        let other = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.link(other, "bob");

        assert_eq!(session.finish(other), Err(SessionError::PermissionDenied));
        assert!(session.is_joinable());

        session.finish(host).unwrap();
        assert!(!session.is_joinable());
        assert_eq!(session.game_state(), GameState::Finished);
        assert_eq!(session.finish(host), Err(SessionError::InvalidState));
    }

    #[test]
    fn idle_probes_accumulate_only_while_empty() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        assert!(!session.idle_probe(3));
        assert!(!session.idle_probe(3));

        session.unlink(host);
        assert!(!session.idle_probe(3));
        assert!(!session.idle_probe(3));
        assert!(session.idle_probe(3));
    }

    #[test]
    fn relink_resets_idle_probes() {
        let host = Uuid::new_v4();
        let session = Session::new(1, 50, host, "alice");
        session.unlink(host);
        assert!(!session.idle_probe(2));

        session.link(host, "alice");
        assert!(!session.idle_probe(2));
        session.unlink(host);
        assert!(!session.idle_probe(2));
        assert!(session.idle_probe(2));
    }
}
