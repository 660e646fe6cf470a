//! `replica_shared`
//!
//! Replication core used by both client and server.
//!
//! Design goals:
//! - Sessions own all state; no process-wide registries.
//! - Binary wire format with explicit, versionable layouts.
//! - Typed errors at every layer; nothing here panics on bad input.
//! - No `unsafe`.

pub mod channel;
pub mod chat;
pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod identity;
pub mod item;
pub mod job;
pub mod lobby;
pub mod login;
pub mod math;
pub mod message;
pub mod net;
pub mod player;
pub mod property;
pub mod replication;
pub mod sequence;
pub mod task;
pub mod tick;
pub mod trainset;
pub mod tracked;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::channel::DeliveryMethod;
    pub use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
    pub use crate::config::*;
    pub use crate::error::{ChannelError, DisconnectReason, ProtocolError};
    pub use crate::event::{EventQueue, SessionEvent};
    pub use crate::identity::{EntityHandle, EntityKind, IdentityRegistry, NetId};
    pub use crate::math::*;
    pub use crate::message::{Message, Protocol};
    pub use crate::net::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
}
