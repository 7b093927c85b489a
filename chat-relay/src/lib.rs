//! Multi-client chat relay over plain TCP.
//!
//! Clients connect, send a username, then exchange framed TEXT and IMAGE
//! messages that the relay forwards to every other connected client.
//!
//! - [`frame`] implements the length-prefixed wire protocol.
//! - [`session`] is one connected client and its serialized writer.
//! - [`registry`] maps usernames to live sessions.
//! - [`relay`] owns the registry, broadcasts, and exposes `start`/`stop`.
//! - [`listener`] runs the accept loop, handshake, and per-session receive loop.
//! - [`cli`] and [`client`] back the `chat-relay` binary.

pub mod cli;
pub mod client;
pub mod frame;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod session;

pub use relay::{Relay, RelayConfig, RelayError, RelayEvent};
