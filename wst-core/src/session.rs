//! Tunnel session identity and lifecycle.

use crate::address::Endpoint;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier for a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the transport handshake (client) or the destination
    /// connect (server).
    Connecting,
    /// Bytes are flowing between the two endpoints.
    Bridging,
    /// Either endpoint closed after bridging.
    Closed,
    /// The session never reached `Bridging`.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Bridging => write!(f, "bridging"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Discrete events that move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    TransportEstablished,
    TransportFailed,
    DestinationConnected,
    DestinationFailed,
    EndpointClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session transition: {event:?} while {state}")]
pub struct InvalidTransition {
    pub state: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    /// Apply an event, returning the next state.
    pub fn on(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Connecting, TransportEstablished | DestinationConnected) => Ok(Bridging),
            (Connecting, TransportFailed | DestinationFailed | EndpointClosed) => Ok(Failed),
            (Bridging, EndpointClosed) => Ok(Closed),
            (state, event) => Err(InvalidTransition { state, event }),
        }
    }
}

/// One local connection (or stdio pair) bridged to one destination.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub id: SessionId,
    /// Description of the local side (peer address or `stdio`).
    pub local: String,
    pub transport: TransportKind,
    /// Requested (client) or resolved (server) destination.
    pub target: Option<Endpoint>,
    state: SessionState,
}

impl TunnelSession {
    pub fn new(local: impl Into<String>, transport: TransportKind, target: Option<Endpoint>) -> Self {
        Self {
            id: SessionId::new(),
            local: local.into(),
            transport,
            target,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Advance the session; invalid transitions leave the state unchanged.
    pub fn advance(&mut self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let next = self.state.on(event)?;
        debug!("Session {} {} -> {}", self.id.short(), self.state, next);
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut session = TunnelSession::new("127.0.0.1:5000", TransportKind::WebSocket, None);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(
            session.advance(SessionEvent::TransportEstablished).unwrap(),
            SessionState::Bridging
        );
        assert_eq!(
            session.advance(SessionEvent::EndpointClosed).unwrap(),
            SessionState::Closed
        );
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut session = TunnelSession::new("stdio", TransportKind::HttpPoll, None);
        assert_eq!(
            session.advance(SessionEvent::DestinationFailed).unwrap(),
            SessionState::Failed
        );
        let err = session.advance(SessionEvent::TransportEstablished).unwrap_err();
        assert_eq!(err.state, SessionState::Failed);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_closed_cannot_reopen() {
        assert!(SessionState::Closed.on(SessionEvent::DestinationConnected).is_err());
        assert!(SessionState::Bridging.on(SessionEvent::TransportFailed).is_err());
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
    }
}
