//! A small group chat relay over TCP.
//!
//! Clients hold one connection each, tag every message with a group name,
//! and receive whatever the other members of that group send. The first
//! message a client sends binds its connection to that group for good.
//!
//! Each module covers one responsibility:
//!
//! - [`server`] accepts connections and assembles a session per client.
//! - [`session`] is the per-connection core: inbound dispatch plus the
//!   serialized outbound write path.
//! - [`group`] and [`registry`] hold the membership sets and the
//!   name-to-group lookup that fan messages out.
//! - [`message`] defines the newline-delimited JSON protocol and its async
//!   read/write helpers.
//! - [`client`] is the interactive terminal client.
//! - [`cli`] parses the command line for all three modes.

pub mod cli;
pub mod client;
pub mod group;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
