//! wst server library.
//!
//! Accepts WebSocket and HTTP long-poll tunnels, resolves each tunnel's
//! destination from its address token (or the configured lock) and relays
//! bytes to it over TCP.

pub mod config;
pub mod poll;
pub mod transport;
pub mod tunnel;

pub use config::ServerConfig;
pub use tunnel::{router, serve, TunnelServer};
