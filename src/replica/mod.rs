//! Peer-side replication consumer
//!
//! Turns decoded snapshots into create/update operations against the local
//! entity set, under the host-vs-client authority rule: the host simulates
//! everything, a client only interpolates toward what it received. Also
//! home of the shared tick clock and the round-trip latency estimator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::codec::{EntityRecord, Vec2};
use crate::util::time::unix_millis;
use crate::ws::protocol::GameState;

/// How often a peer sends a `timeSync` probe
pub const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// At most this many entries go into a host's initial roster
pub const ROSTER_LIMIT: usize = 4;

/// Role of this peer inside the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    Host,
    Client,
}

/// Monotonic tick clock shared between host and clients.
///
/// The origin tick and interval arrive with the `state` push; the latency
/// estimate from `timeSync` shifts the elapsed time so a freshly computed
/// tick lands close to the host's. Best effort - good enough for smooth
/// interpolation, nothing more.
#[derive(Debug)]
pub struct TickClock {
    started: Option<Instant>,
    origin_tick: i64,
    interval_ms: u64,
    latency_ms: u64,
}

impl TickClock {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            started: None,
            origin_tick: 0,
            interval_ms: interval_ms.max(1),
            latency_ms: 0,
        }
    }

    /// (Re)start from an origin tick received from the server
    pub fn start(&mut self, origin_tick: i64) {
        self.started = Some(Instant::now());
        self.origin_tick = origin_tick;
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms.max(1);
    }

    pub fn set_latency(&mut self, latency_ms: u64) {
        self.latency_ms = latency_ms;
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Current tick, or the origin while the clock has not been started
    pub fn current_tick(&self) -> i64 {
        match self.started {
            Some(started) => {
                let elapsed = started.elapsed().as_millis() as u64 + self.latency_ms;
                self.origin_tick + (elapsed / self.interval_ms) as i64
            }
            None => self.origin_tick,
        }
    }

    /// Fold a `timeSync` reply into the latency estimate: half the
    /// observed round trip is the one-way delay.
    pub fn on_time_sync_reply(&mut self, client_time: u64) {
        let now = unix_millis();
        let round_trip = now.saturating_sub(client_time);
        self.latency_ms = round_trip / 2;
        trace!(latency_ms = self.latency_ms, "Latency updated");
    }
}

/// One locally known entity
#[derive(Debug, Clone)]
pub struct ReplicaEntity {
    pub record: EntityRecord,
    /// Whether this peer may exert simulation forces on the entity.
    /// Maps 1:1 to the authority rule: true only on the host.
    pub owned: bool,
}

/// What applying a snapshot produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    pub stale: usize,
}

/// Outcome of feeding one decoded snapshot to the world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ApplyStats),
    /// An empty snapshot arrived while we have no roster: the sender must
    /// be asked for a `prepare` re-send. Empty is not "no entities exist".
    RosterNeeded,
}

/// The local entity set of one peer
pub struct ReplicaWorld {
    mode: PeerMode,
    view: GameState,
    entities: HashMap<i64, ReplicaEntity>,
}

impl ReplicaWorld {
    pub fn new(mode: PeerMode) -> Self {
        Self {
            mode,
            view: GameState::Connecting,
            entities: HashMap::new(),
        }
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    /// Host re-election can change our role mid-session
    pub fn set_mode(&mut self, mode: PeerMode) {
        if self.mode != mode {
            debug!(?mode, "Peer mode changed");
            self.mode = mode;
            let owned = mode == PeerMode::Host;
            for entity in self.entities.values_mut() {
                entity.owned = owned;
            }
        }
    }

    pub fn view(&self) -> GameState {
        self.view
    }

    /// Track the session state as reported by the server, applying the
    /// local transition rules (a client is never `Creating`; a host skips
    /// the prepare wait).
    pub fn observe_state(&mut self, reported: GameState) {
        let next = match (self.view, reported) {
            (GameState::Connecting, GameState::Creating) if self.mode == PeerMode::Client => {
                // Only the elected first joiner authors the roster
                GameState::Connecting
            }
            (_, other) => other,
        };
        if next != self.view {
            debug!(from = ?self.view, to = ?next, "Session view transition");
            self.view = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity(&self, id: i64) -> Option<&ReplicaEntity> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Apply one decoded snapshot.
    ///
    /// Unknown ids become new entities seeded from the record; known ids
    /// are overwritten only when the record's tick is not older than what
    /// we already applied, so duplicate or reordered delivery is harmless.
    pub fn apply(&mut self, records: &[EntityRecord]) -> ApplyOutcome {
        if records.is_empty() && self.entities.is_empty() && self.view == GameState::Preparing {
            debug!("Empty snapshot without roster, requesting prepare");
            return ApplyOutcome::RosterNeeded;
        }

        let mut stats = ApplyStats::default();

        for record in records {
            match self.entities.get_mut(&record.id) {
                None => {
                    trace!(entity_id = record.id, "Create entity");
                    self.entities.insert(
                        record.id,
                        ReplicaEntity {
                            record: record.clone(),
                            owned: self.mode == PeerMode::Host,
                        },
                    );
                    stats.created += 1;
                }
                Some(entity) => {
                    if record.tick < entity.record.tick {
                        stats.stale += 1;
                        continue;
                    }
                    entity.record = record.clone();
                    stats.updated += 1;
                }
            }
        }

        // A non-empty world in Preparing has its roster; playing can begin
        // once the server says so
        if self.view == GameState::Preparing && !self.entities.is_empty() {
            self.observe_state(GameState::Playing);
        }

        ApplyOutcome::Applied(stats)
    }

    /// Records for everything this peer is authoritative over, stamped
    /// with the given tick. What a host broadcasts every tick interval.
    pub fn authored_records(&self, tick: i64) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self
            .entities
            .values()
            .filter(|e| e.owned)
            .map(|e| {
                let mut record = e.record.clone();
                record.tick = tick;
                record
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

/// Build the host's initial roster from the fixed spawn list, capped.
/// Ids here are placeholders; the server reassigns them on `create`.
pub fn build_initial_roster(spawns: &[Vec2]) -> Vec<EntityRecord> {
    if spawns.len() > ROSTER_LIMIT {
        warn!(
            spawns = spawns.len(),
            limit = ROSTER_LIMIT,
            "Spawn list truncated"
        );
    }
    spawns
        .iter()
        .take(ROSTER_LIMIT)
        .enumerate()
        .map(|(i, pos)| EntityRecord::soldier(i as i64, 0, *pos))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EntityBody, EntityPhase, LivingState};

    fn soldier(id: i64, tick: i64, x: f64) -> EntityRecord {
        EntityRecord::soldier(id, tick, Vec2::new(x, 0.0))
    }

    #[test]
    fn unknown_ids_create_entities_without_authority_on_client() {
        let mut world = ReplicaWorld::new(PeerMode::Client);
        let outcome = world.apply(&[soldier(5, 1, 0.0), soldier(6, 1, 10.0)]);
        assert_eq!(
            outcome,
            ApplyOutcome::Applied(ApplyStats {
                created: 2,
                updated: 0,
                stale: 0
            })
        );
        assert!(!world.entity(5).unwrap().owned);
        assert!(!world.entity(6).unwrap().owned);
    }

    #[test]
    fn host_owns_created_entities() {
        let mut world = ReplicaWorld::new(PeerMode::Host);
        world.apply(&[soldier(5, 1, 0.0)]);
        assert!(world.entity(5).unwrap().owned);
    }

    #[test]
    fn stale_update_is_rejected() {
        let mut world = ReplicaWorld::new(PeerMode::Client);
        world.apply(&[soldier(5, 10, 100.0)]);

        let outcome = world.apply(&[soldier(5, 7, 999.0)]);
        assert_eq!(
            outcome,
            ApplyOutcome::Applied(ApplyStats {
                created: 0,
                updated: 0,
                stale: 1
            })
        );
        let entity = world.entity(5).unwrap();
        assert_eq!(entity.record.tick, 10);
        assert_eq!(entity.record.position.x, 100.0);
    }

    #[test]
    fn applying_a_snapshot_twice_is_idempotent() {
        let snapshot = vec![soldier(1, 4, 1.0), soldier(2, 4, 2.0)];

        let mut once = ReplicaWorld::new(PeerMode::Client);
        once.apply(&snapshot);

        let mut twice = ReplicaWorld::new(PeerMode::Client);
        twice.apply(&snapshot);
        twice.apply(&snapshot);

        assert_eq!(once.entity_count(), twice.entity_count());
        for id in [1, 2] {
            assert_eq!(
                once.entity(id).unwrap().record,
                twice.entity(id).unwrap().record
            );
        }
    }

    #[test]
    fn empty_snapshot_while_preparing_requests_roster() {
        let mut world = ReplicaWorld::new(PeerMode::Client);
        world.observe_state(GameState::Preparing);
        assert_eq!(world.apply(&[]), ApplyOutcome::RosterNeeded);

        // With a roster present, empty means "nothing changed"
        world.apply(&[soldier(1, 0, 0.0)]);
        assert!(matches!(world.apply(&[]), ApplyOutcome::Applied(_)));
    }

    #[test]
    fn client_does_not_enter_creating() {
        let mut world = ReplicaWorld::new(PeerMode::Client);
        world.observe_state(GameState::Creating);
        assert_eq!(world.view(), GameState::Connecting);

        let mut host = ReplicaWorld::new(PeerMode::Host);
        host.observe_state(GameState::Creating);
        assert_eq!(host.view(), GameState::Creating);
    }

    #[test]
    fn receiving_roster_while_preparing_moves_to_playing() {
        let mut world = ReplicaWorld::new(PeerMode::Client);
        world.observe_state(GameState::Preparing);
        world.apply(&[soldier(1, 0, 0.0)]);
        assert_eq!(world.view(), GameState::Playing);
    }

    #[test]
    fn promotion_to_host_takes_ownership() {
        let mut world = ReplicaWorld::new(PeerMode::Client);
        world.apply(&[soldier(1, 0, 0.0)]);
        assert!(!world.entity(1).unwrap().owned);

        world.set_mode(PeerMode::Host);
        assert!(world.entity(1).unwrap().owned);
    }

    #[test]
    fn authored_records_carry_the_stamped_tick() {
        let mut world = ReplicaWorld::new(PeerMode::Host);
        world.apply(&[soldier(2, 0, 5.0), soldier(1, 0, 3.0)]);

        let records = world.authored_records(42);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.tick == 42));
        assert_eq!(records[0].id, 1);

        let client = ReplicaWorld::new(PeerMode::Client);
        assert!(client.authored_records(42).is_empty());
    }

    #[test]
    fn roster_builder_caps_the_spawn_list() {
        let spawns: Vec<Vec2> = (0..10).map(|i| Vec2::new(i as f64, 0.0)).collect();
        let roster = build_initial_roster(&spawns);
        assert_eq!(roster.len(), ROSTER_LIMIT);
        assert!(matches!(
            roster[0].body,
            EntityBody::EnemySoldier(LivingState { .. }, _, _)
        ));
        assert!(roster.iter().all(|r| r.phase == EntityPhase::Active));
    }

    #[test]
    fn tick_clock_advances_from_origin() {
        let mut clock = TickClock::new(50);
        assert_eq!(clock.current_tick(), 0);
        clock.start(120);
        assert!(clock.current_tick() >= 120);

        // 200ms of latency is four 50ms ticks of compensation
        clock.set_latency(200);
        assert!(clock.current_tick() >= 124);
    }

    #[test]
    fn time_sync_reply_halves_the_round_trip() {
        let mut clock = TickClock::new(50);
        clock.on_time_sync_reply(unix_millis().saturating_sub(80));
        assert!(clock.latency_ms() >= 40);
        assert!(clock.latency_ms() < 80);
    }
}
