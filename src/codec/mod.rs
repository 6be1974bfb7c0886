//! Binary snapshot codec
//!
//! A snapshot is an ordered list of entity-state records produced at one
//! simulation step. On the wire it is a count-prefixed sequence of
//! type-tagged records, zlib-compressed as a whole. Corrupt, truncated or
//! version-mismatched buffers decode to `None`; a bad frame must never be
//! able to take a peer down.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::warn;

/// `SNAP` in ASCII
const SNAPSHOT_MAGIC: u32 = 0x534E_4150;
const SNAPSHOT_VERSION: u16 = 1;

/// Upper bound for the count prefix, guards against hostile headers
const MAX_RECORDS: u32 = 4096;

/// Widest record on the wire (soldier body)
const MAX_RECORD_WIRE: u64 = 1 + 8 + 8 + 1 + 32 + 9 + 9 + 8;

/// Decompression cap: header plus a full snapshot of the widest records.
/// Anything inflating past this is hostile, not a snapshot.
const MAX_SNAPSHOT_BYTES: u64 = 10 + MAX_RECORDS as u64 * MAX_RECORD_WIRE;

/// Lifecycle phase of a replicated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityPhase {
    #[default]
    Invalid,
    Active,
    Inactive,
    Sleep,
}

impl EntityPhase {
    fn to_wire(self) -> u8 {
        match self {
            EntityPhase::Invalid => 0,
            EntityPhase::Active => 1,
            EntityPhase::Inactive => 2,
            EntityPhase::Sleep => 3,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntityPhase::Invalid),
            1 => Some(EntityPhase::Active),
            2 => Some(EntityPhase::Inactive),
            3 => Some(EntityPhase::Sleep),
            _ => None,
        }
    }
}

/// Behavior state of an enemy entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Invalid,
    Idle,
    Move,
    WatchPlayer,
    Attack,
    Dead,
}

impl Behavior {
    fn to_wire(self) -> u8 {
        match self {
            Behavior::Invalid => 0,
            Behavior::Idle => 1,
            Behavior::Move => 2,
            Behavior::WatchPlayer => 3,
            Behavior::Attack => 4,
            Behavior::Dead => 5,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Behavior::Invalid),
            1 => Some(Behavior::Idle),
            2 => Some(Behavior::Move),
            3 => Some(Behavior::WatchPlayer),
            4 => Some(Behavior::Attack),
            5 => Some(Behavior::Dead),
            _ => None,
        }
    }
}

/// 2D vector, world units
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Health and facing shared by all living entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LivingState {
    pub hp: i32,
    pub max_hp: i32,
    pub facing_left: bool,
}

/// Enemy decision state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnemyBrain {
    pub behavior: Behavior,
    pub attack_in_ms: f64,
}

/// Timers specific to the soldier enemy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoldierTimers {
    pub turn_elapsed_ms: i32,
    pub attack_elapsed_ms: i32,
}

/// Type-specific payload of a record; the wire tag is derived from the
/// variant so the decoder can reconstruct the right shape.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityBody {
    /// Position-only marker object
    Marker,
    /// Living entity (players and the like)
    Living(LivingState),
    /// Generic enemy
    Enemy(LivingState, EnemyBrain),
    /// Soldier enemy with patrol timers
    EnemySoldier(LivingState, EnemyBrain, SoldierTimers),
}

impl EntityBody {
    fn kind_tag(&self) -> u8 {
        match self {
            EntityBody::Marker => 1,
            EntityBody::Living(_) => 2,
            EntityBody::Enemy(..) => 3,
            EntityBody::EnemySoldier(..) => 4,
        }
    }
}

/// One row in a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Entity id, unique within a session, assigned by the host/server
    pub id: i64,
    /// Monotonically increasing tick this record was produced at
    pub tick: i64,
    pub phase: EntityPhase,
    pub position: Vec2,
    pub size: Vec2,
    pub body: EntityBody,
}

impl EntityRecord {
    pub fn soldier(id: i64, tick: i64, position: Vec2) -> Self {
        Self {
            id,
            tick,
            phase: EntityPhase::Active,
            position,
            size: Vec2::default(),
            body: EntityBody::EnemySoldier(
                LivingState::default(),
                EnemyBrain::default(),
                SoldierTimers::default(),
            ),
        }
    }
}

/// Encode a record list into the uncompressed wire layout
pub fn encode(records: &[EntityRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + records.len() * 64);

    buf.put_u32(SNAPSHOT_MAGIC);
    buf.put_u16(SNAPSHOT_VERSION);
    buf.put_u32(records.len() as u32);

    for record in records {
        buf.put_u8(record.body.kind_tag());
        buf.put_i64(record.id);
        buf.put_i64(record.tick);
        buf.put_u8(record.phase.to_wire());
        buf.put_f64(record.position.x);
        buf.put_f64(record.position.y);
        buf.put_f64(record.size.x);
        buf.put_f64(record.size.y);

        match &record.body {
            EntityBody::Marker => {}
            EntityBody::Living(living) => put_living(&mut buf, living),
            EntityBody::Enemy(living, brain) => {
                put_living(&mut buf, living);
                put_brain(&mut buf, brain);
            }
            EntityBody::EnemySoldier(living, brain, timers) => {
                put_living(&mut buf, living);
                put_brain(&mut buf, brain);
                buf.put_i32(timers.turn_elapsed_ms);
                buf.put_i32(timers.attack_elapsed_ms);
            }
        }
    }

    buf.freeze()
}

fn put_living(buf: &mut BytesMut, living: &LivingState) {
    buf.put_i32(living.hp);
    buf.put_i32(living.max_hp);
    buf.put_u8(living.facing_left as u8);
}

fn put_brain(buf: &mut BytesMut, brain: &EnemyBrain) {
    buf.put_u8(brain.behavior.to_wire());
    buf.put_f64(brain.attack_in_ms);
}

/// Decode an uncompressed buffer into a record list.
/// Returns `None` on any structural problem.
pub fn decode(data: &[u8]) -> Option<Vec<EntityRecord>> {
    let mut r = Reader { buf: data };

    if r.u32()? != SNAPSHOT_MAGIC {
        warn!("Snapshot magic mismatch");
        return None;
    }
    let version = r.u16()?;
    if version != SNAPSHOT_VERSION {
        warn!(version, "Unsupported snapshot version");
        return None;
    }

    let count = r.u32()?;
    if count > MAX_RECORDS {
        warn!(count, "Snapshot record count out of bounds");
        return None;
    }

    let mut records = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let kind = r.u8()?;
        let id = r.i64()?;
        let tick = r.i64()?;
        let phase = EntityPhase::from_wire(r.u8()?)?;
        let position = Vec2::new(r.f64()?, r.f64()?);
        let size = Vec2::new(r.f64()?, r.f64()?);

        let body = match kind {
            1 => EntityBody::Marker,
            2 => EntityBody::Living(r.living()?),
            3 => EntityBody::Enemy(r.living()?, r.brain()?),
            4 => {
                let living = r.living()?;
                let brain = r.brain()?;
                let timers = SoldierTimers {
                    turn_elapsed_ms: r.i32()?,
                    attack_elapsed_ms: r.i32()?,
                };
                EntityBody::EnemySoldier(living, brain, timers)
            }
            other => {
                warn!(kind = other, "Unknown snapshot record kind");
                return None;
            }
        };

        records.push(EntityRecord {
            id,
            tick,
            phase,
            position,
            size,
            body,
        });
    }

    Some(records)
}

/// Compress an encoded snapshot for transmission
pub fn pack(records: &[EntityRecord]) -> Bytes {
    let raw = encode(records);
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    // Writing into a Vec cannot fail
    let _ = encoder.write_all(&raw);
    match encoder.finish() {
        Ok(compressed) => Bytes::from(compressed),
        Err(_) => raw,
    }
}

/// Decompress and decode a received snapshot.
/// Returns `None` for anything that is not a well-formed compressed
/// snapshot, including buffers that inflate past the snapshot size cap.
pub fn unpack(data: &[u8]) -> Option<Vec<EntityRecord>> {
    let mut decoder = ZlibDecoder::new(data).take(MAX_SNAPSHOT_BYTES + 1);
    let mut raw = Vec::new();
    if decoder.read_to_end(&mut raw).is_err() {
        warn!(len = data.len(), "Snapshot decompression failed");
        return None;
    }
    if raw.len() as u64 > MAX_SNAPSHOT_BYTES {
        warn!(len = data.len(), "Snapshot inflates past the size cap");
        return None;
    }
    decode(&raw)
}

/// Bounds-checked big-endian reader
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_be_bytes(b.try_into().unwrap()))
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_be_bytes(b.try_into().unwrap()))
    }

    fn f64(&mut self) -> Option<f64> {
        self.take(8).map(|b| f64::from_be_bytes(b.try_into().unwrap()))
    }

    fn living(&mut self) -> Option<LivingState> {
        Some(LivingState {
            hp: self.i32()?,
            max_hp: self.i32()?,
            facing_left: self.u8()? != 0,
        })
    }

    fn brain(&mut self) -> Option<EnemyBrain> {
        Some(EnemyBrain {
            behavior: Behavior::from_wire(self.u8()?)?,
            attack_in_ms: self.f64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<EntityRecord> {
        vec![
            EntityRecord {
                id: 1001,
                tick: 42,
                phase: EntityPhase::Active,
                position: Vec2::new(128.5, -33.25),
                size: Vec2::new(32.0, 64.0),
                body: EntityBody::EnemySoldier(
                    LivingState {
                        hp: 7,
                        max_hp: 10,
                        facing_left: true,
                    },
                    EnemyBrain {
                        behavior: Behavior::WatchPlayer,
                        attack_in_ms: 1250.0,
                    },
                    SoldierTimers {
                        turn_elapsed_ms: 300,
                        attack_elapsed_ms: 0,
                    },
                ),
            },
            EntityRecord {
                id: 1002,
                tick: 42,
                phase: EntityPhase::Sleep,
                position: Vec2::new(0.0, 0.0),
                size: Vec2::default(),
                body: EntityBody::Marker,
            },
            EntityRecord {
                id: 1003,
                tick: 43,
                phase: EntityPhase::Active,
                position: Vec2::new(512.0, 96.0),
                size: Vec2::new(24.0, 48.0),
                body: EntityBody::Living(LivingState {
                    hp: 3,
                    max_hp: 3,
                    facing_left: false,
                }),
            },
            EntityRecord {
                id: 1004,
                tick: 44,
                phase: EntityPhase::Inactive,
                position: Vec2::new(-5.0, 17.75),
                size: Vec2::new(32.0, 32.0),
                body: EntityBody::Enemy(
                    LivingState {
                        hp: 1,
                        max_hp: 5,
                        facing_left: true,
                    },
                    EnemyBrain {
                        behavior: Behavior::Dead,
                        attack_in_ms: -1.0,
                    },
                ),
            },
        ]
    }

    #[test]
    fn round_trip_preserves_order_and_content() {
        let records = sample_records();
        let packed = pack(&records);
        assert_eq!(unpack(&packed), Some(records));
    }

    #[test]
    fn empty_snapshot_round_trips() {
        let packed = pack(&[]);
        assert_eq!(unpack(&packed), Some(Vec::new()));
    }

    #[test]
    fn truncated_buffer_decodes_to_none() {
        let raw = encode(&sample_records());
        for cut in [0, 1, 5, 11, raw.len() - 1] {
            assert_eq!(decode(&raw[..cut]), None, "cut at {}", cut);
        }
    }

    #[test]
    fn corrupt_compressed_buffer_decodes_to_none() {
        let mut packed = pack(&sample_records()).to_vec();
        let mid = packed.len() / 2;
        packed[mid] ^= 0xFF;
        // Either decompression or decoding fails; both must yield None
        assert_eq!(unpack(&packed), None);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut raw = encode(&sample_records()).to_vec();
        raw[0] ^= 0x01;
        assert_eq!(decode(&raw), None);

        let mut raw = encode(&sample_records()).to_vec();
        raw[5] = 99; // version low byte
        assert_eq!(decode(&raw), None);
    }

    #[test]
    fn unknown_kind_tag_fails_the_decode() {
        let mut raw = encode(&sample_records()).to_vec();
        raw[10] = 200; // first record's kind tag
        assert_eq!(decode(&raw), None);
    }

    #[test]
    fn inflating_past_the_size_cap_is_rejected() {
        // A tiny compressed buffer expanding to megabytes of zeros
        let zeros = vec![0u8; MAX_SNAPSHOT_BYTES as usize + 1024];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        let _ = encoder.write_all(&zeros);
        let bomb = encoder.finish().unwrap();
        assert!(bomb.len() < zeros.len() / 100);

        assert_eq!(unpack(&bomb), None);
    }

    #[test]
    fn hostile_count_prefix_is_bounded() {
        let mut buf = BytesMut::new();
        buf.put_u32(SNAPSHOT_MAGIC);
        buf.put_u16(SNAPSHOT_VERSION);
        buf.put_u32(u32::MAX);
        assert_eq!(decode(&buf), None);
    }
}
