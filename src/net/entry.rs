//! Per-peer connection table record and pending-fragment type

use super::peer_id::PeerId;
use super::session_key::SessionKey;
use std::time::Instant;

/// Multiplier bounding `send_window` as a factor of `max_bpm`.
pub const MAX_BUF_FACT: u32 = 2;
/// Violation count at which a peer is disconnected.
pub const MAX_VIOLATIONS: u32 = 10;
/// Hard cap on queued bytes per entry: 8 * EXPECTED_MTU.
pub const EXPECTED_MTU: usize = 1400;
pub const MAX_SEND_BUFFER_SIZE: usize = 8 * EXPECTED_MTU;
/// Priority reserved for administrative / HANGUP traffic; bypasses the
/// frequency gate and most load shedding.
pub const EXTREME_PRIORITY: u32 = u32::MAX;

/// Session-establishment state of an `Entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Down,
    SetKeySent,
    SetKeyReceived,
    Up,
}

/// Where a `SendEntry` must land in the assembled frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Head,
    None,
    Tail,
}

/// A pending outbound fragment.
///
/// `payload` is either eagerly built bytes or a deferred builder
/// invoked at selection time (step 4 of §4.2); builders that fail are
/// dropped rather than aborting the whole selection round.
pub enum Payload {
    Bytes(Vec<u8>),
    Builder(Box<dyn FnOnce() -> Option<Vec<u8>> + Send>),
}

pub struct SendEntry {
    pub payload: Payload,
    pub length: usize,
    pub priority: u32,
    pub deadline: Instant,
    pub placement: Placement,
    /// Set by the scheduler during a selection round; read back by
    /// callers asserting the knapsack-correctness testable property.
    pub selected: bool,
}

impl SendEntry {
    pub fn new_bytes(bytes: Vec<u8>, priority: u32, deadline: Instant, placement: Placement) -> Self {
        let length = bytes.len();
        Self {
            payload: Payload::Bytes(bytes),
            length,
            priority,
            deadline,
            placement,
            selected: false,
        }
    }

    /// Run the builder (if deferred), consuming this entry's payload slot.
    pub fn resolve(self) -> Option<Vec<u8>> {
        match self.payload {
            Payload::Bytes(b) => Some(b),
            Payload::Builder(f) => f(),
        }
    }
}

/// Per-peer connection table record.
pub struct Entry {
    pub peer: PeerId,
    pub status: Status,
    pub transport_session: Option<usize>,
    pub mtu: u16,

    pub local_key: Option<SessionKey>,
    pub remote_key: Option<SessionKey>,

    pub last_seq_sent: u32,
    pub last_seq_received: u32,
    pub recent_seq_bitmap: u32,

    pub send_buffer: Vec<SendEntry>,

    pub max_bpm: u32,
    pub send_window: i64,
    pub ideal_limit: u32,
    pub max_transmitted_limit: u32,
    pub recently_received: u64,

    pub value: f64,
    pub violations: u32,

    pub last_alive: u64,
    pub established_at: u64,
    pub last_send_attempt: u64,
    pub last_bps_update: u64,
    pub last_reservation_update: u64,

    pub downstream_reserved: u64,
    pub consider_transport_switch: bool,

    pub overflow_next: Option<usize>,
}

impl Entry {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            status: Status::Down,
            transport_session: None,
            mtu: 0,
            local_key: None,
            remote_key: None,
            last_seq_sent: 0,
            last_seq_received: 0,
            recent_seq_bitmap: 0,
            send_buffer: Vec::new(),
            max_bpm: 0,
            send_window: 0,
            ideal_limit: 0,
            max_transmitted_limit: 0,
            recently_received: 0,
            value: 0.0,
            violations: 0,
            last_alive: 0,
            established_at: 0,
            last_send_attempt: 0,
            last_bps_update: 0,
            last_reservation_update: 0,
            downstream_reserved: 0,
            consider_transport_switch: false,
            overflow_next: None,
        }
    }

    /// Reset an entry back to `Down`, freeing keys and clearing the
    /// send buffer, ready for reuse by the connection table.
    pub fn reset_to_down(&mut self) {
        self.status = Status::Down;
        self.local_key = None;
        self.remote_key = None;
        self.send_buffer.clear();
        self.transport_session = None;
        self.last_seq_sent = 0;
        self.last_seq_received = 0;
        self.recent_seq_bitmap = 0;
    }

    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }

    pub fn queued_bytes(&self) -> usize {
        self.send_buffer.iter().map(|e| e.length).sum()
    }

    /// Insert in sorted order by descending `priority / length` ratio,
    /// matching §4.2 step 4.
    pub fn insert_sorted(&mut self, entry: SendEntry) {
        let ratio = |e: &SendEntry| e.priority as f64 / e.length.max(1) as f64;
        let r = ratio(&entry);
        let pos = self
            .send_buffer
            .iter()
            .position(|e| ratio(e) < r)
            .unwrap_or(self.send_buffer.len());
        self.send_buffer.insert(pos, entry);
    }
}
