//! wst client library.
//!
//! Exposes a local TCP port (or standard I/O) through a WebSocket or HTTP
//! long-poll tunnel to a wst server.

pub mod config;
pub mod transport;
pub mod tunnel;

pub use config::ClientConfig;
pub use tunnel::{ClientContext, ClientEvent, TunnelClient};
