//! Secure peer-to-peer connection core: connection table and session
//! state machine, SETKEY/PING-PONG handshake, knapsack outbound
//! scheduler, inbound bandwidth allocator, encrypted-frame codec,
//! dispatcher, and cron/liveness sweep.

pub mod allocator;
pub mod clock;
pub mod codec;
pub mod config;
pub mod core;
pub mod cron;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod handshake;
pub mod hello;
pub mod message;
pub mod peer_id;
pub mod scheduler;
pub mod session_key;
pub mod table;
pub mod transport;

pub use allocator::{AllocatorDecision, AllocatorInput, PeerDisposition};
pub use clock::{Clock, FakeClock, SystemClock};
pub use codec::{CodecError, FrameHeader};
pub use config::{Config, SchedulerConfig};
pub use core::Core;
pub use cron::CronStats;
pub use dispatcher::{Handler, HandlerCapability, HandlerTables, InboundFrame};
pub use entry::{Entry, Placement, SendEntry, Status};
pub use error::CoreError;
pub use handshake::{HandshakeError, HandshakeOutcome, PingTable, SignatureVerifier, Signer};
pub use hello::HelloMessage;
pub use message::Message;
pub use peer_id::PeerId;
pub use scheduler::{AppendOutcome, SchedulerStats};
pub use session_key::SessionKey;
pub use table::Table;
pub use transport::{MockTransport, SendResult, Transport};
