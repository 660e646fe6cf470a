//! Error taxonomy shared by client and server.
//!
//! - Decode errors ([`crate::codec::DecodeError`]): the packet is dropped.
//! - Protocol errors: one update is dropped, the session carries on.
//! - Channel errors: the connection is gone; surfaced as a disconnect.
//! - Authorization errors live next to the exchange they belong to
//!   ([`crate::login::LoginDenied`], [`crate::job::ValidationOutcome`]).

use std::fmt;

use thiserror::Error;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::identity::{NetId, RegistryError};

/// An update that decoded fine but doesn't fit local state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown network identity {0}")]
    UnknownIdentity(NetId),
    #[error("update for {target} carries {got} entries, expected {expected}")]
    LengthMismatch {
        target: NetId,
        expected: usize,
        got: usize,
    },
    #[error("field ordinal {ordinal} not registered on {entity}")]
    UnknownField { entity: NetId, ordinal: u8 },
    #[error("task tag {0} has no registered codec")]
    UnregisteredTaskTag(u8),
    #[error("{what} has {count} entries, wire limit is {limit}")]
    TooMany {
        what: &'static str,
        count: usize,
        limit: usize,
    },
    #[error("message {0} is not valid in this session state")]
    UnexpectedMessage(&'static str),
    #[error("player {player} does not own {entity}")]
    NotOwner { player: u8, entity: NetId },
    #[error("compression failed: {0}")]
    Compression(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Why a connected channel gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("no datagram from {peer} for {silent_ms} ms")]
    TimedOut { peer: String, silent_ms: u64 },
    #[error("reliable message {seq} unacknowledged after {attempts} sends")]
    Unacknowledged { seq: u16, attempts: u32 },
    #[error("reliable send window full ({in_flight} in flight)")]
    WindowFull { in_flight: usize },
}

/// Reason carried by a disconnect event. Every reason has a locale key and
/// an English fallback text for the game layer to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The server refused the login; details are in the denial.
    ConnectionRejected = 0,
    /// No traffic or acknowledgements within the timeout.
    Timeout = 1,
    /// The remote side closed the session.
    RemoteConnectionClose = 2,
    /// The host removed this player.
    Kicked = 3,
    /// Local side closed the session.
    DisconnectPeerCalled = 4,
    /// The host is shutting down.
    ServerShutdown = 5,
    /// The connection attempt never got an answer.
    ConnectionFailed = 6,
}

impl DisconnectReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => DisconnectReason::ConnectionRejected,
            1 => DisconnectReason::Timeout,
            2 => DisconnectReason::RemoteConnectionClose,
            3 => DisconnectReason::Kicked,
            4 => DisconnectReason::DisconnectPeerCalled,
            5 => DisconnectReason::ServerShutdown,
            6 => DisconnectReason::ConnectionFailed,
            _ => return None,
        })
    }

    pub fn locale_key(self) -> &'static str {
        match self {
            DisconnectReason::ConnectionRejected => "disconn/rejected",
            DisconnectReason::Timeout => "disconn/timeout",
            DisconnectReason::RemoteConnectionClose => "disconn/remote_closed",
            DisconnectReason::Kicked => "disconn/kicked",
            DisconnectReason::DisconnectPeerCalled => "disconn/local_closed",
            DisconnectReason::ServerShutdown => "disconn/shutdown",
            DisconnectReason::ConnectionFailed => "disconn/unreachable",
        }
    }

    pub fn default_text(self) -> &'static str {
        match self {
            DisconnectReason::ConnectionRejected => "The server rejected the connection.",
            DisconnectReason::Timeout => "Connection timed out.",
            DisconnectReason::RemoteConnectionClose => "The server closed the connection.",
            DisconnectReason::Kicked => "You were kicked!",
            DisconnectReason::DisconnectPeerCalled => "Disconnected.",
            DisconnectReason::ServerShutdown => "The server shut down.",
            DisconnectReason::ConnectionFailed => "Could not reach the server.",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_text())
    }
}

impl Encode for DisconnectReason {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(*self as u8);
    }
}

impl Decode for DisconnectReason {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let v = r.get_u8()?;
        DisconnectReason::from_u8(v).ok_or(DecodeError::UnknownVariant {
            kind: "disconnect reason",
            value: v,
        })
    }
}

impl From<&ChannelError> for DisconnectReason {
    fn from(_: &ChannelError) -> Self {
        DisconnectReason::Timeout
    }
}
