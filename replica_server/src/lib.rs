//! `replica_server`
//!
//! Host side of the replication core:
//! - [`session::ServerSession`]: all authoritative state plus one
//!   connection per logged-in peer
//! - [`server::GameServer`]: fixed-timestep async loop over a transport
//! - [`world::SimWorld`]: toy host world for the binary and tests
//!
//! Networking model: one UDP socket; reliable-ordered, sequenced and
//! unconnected delivery are layered on top by `replica_shared`.

pub mod server;
pub mod session;
pub mod world;

pub use server::GameServer;
pub use session::{HostWorld, ServerSession};
