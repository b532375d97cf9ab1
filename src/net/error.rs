//! Error kinds and recovery policy (§7)

use super::peer_id::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed frame from {0}")]
    MalformedFrame(PeerId),

    #[error("invalid signature from {0}")]
    SignatureInvalid(PeerId),

    #[error("replay or stale frame from {0}")]
    ReplayOrStale(PeerId),

    #[error("transport would block for {0}")]
    TransportWouldBlock(PeerId),

    #[error("transport fatal error for {0}: {1}")]
    TransportFatal(PeerId, #[source] std::io::Error),

    #[error("peer {0} exceeded violation cap")]
    ViolationCap(PeerId),

    #[error("handshake timed out for {0}")]
    HandshakeTimeout(PeerId),

    #[error("dispatch queue full, dropping frame from {0}")]
    QueueFull(PeerId),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("ping table full (capacity reached)")]
    PingTableFull,

    #[error("codec error: {0}")]
    Codec(#[from] super::codec::CodecError),
}
