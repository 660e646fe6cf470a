//! `replica_client`
//!
//! Client side of the replication core:
//! - [`ClientSession`]: mirrors host state, drives login, job validation
//!   and owned-entity writes
//! - [`GameClient`]: async loop around a session and a transport
//! - [`ServerBrowser`]: lobby list, LAN discovery and batched pings

pub mod browser;
pub mod client;
pub mod session;
pub mod world;

pub use browser::ServerBrowser;
pub use client::GameClient;
pub use session::{ClientSession, ClientWorld};
