//! Core types and protocols for the wst tunnel.
//!
//! This crate provides shared functionality between the tunnel server and client,
//! including address tokens, the stream bridge, and transport plumbing.

pub mod address;
pub mod auth;
pub mod bridge;
pub mod error;
pub mod privilege;
pub mod protocol;
pub mod session;
pub mod token;
pub mod transport;

pub use address::{Endpoint, TunnelSpec};
pub use auth::{AuthContext, ClientIdentity};
pub use bridge::{BridgeConfig, BridgeReport};
pub use error::{ErrorCategory, TunnelError, TunnelResult};
pub use session::{SessionId, SessionState, TunnelSession};
pub use token::AddressToken;
pub use transport::{TransportConnection, TransportKind};
