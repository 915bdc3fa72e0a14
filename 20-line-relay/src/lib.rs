//! Line-oriented broadcast relay.
//!
//! Clients connect over TCP, send their display name as the first line, and
//! from then on every line they send is relayed to every other connected
//! client as `<name>: <line>`. Arrivals and departures are announced as
//! `<name> joined` and `<name> left`; the line `exit` disconnects.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`server`] accepts connections and supervises one task per session.
//! - [`relay`] admits peers and runs the per-session read loop.
//! - [`registry`] holds the active sessions and performs the fan-out.
//! - [`session`] wraps one peer's streams and lifecycle state.
//! - [`protocol`] defines the wire lines and framing helpers.
//! - [`client`] is the terminal client.

pub mod cli;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
