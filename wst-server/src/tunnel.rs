//! Tunnel server: authentication, destination connect and the HTTP router.
//!
//! WebSocket upgrades and long-poll open requests both arrive on `/` and go
//! through [`TunnelServer::dispatch`], which resolves the destination,
//! connects to it and only then accepts the pending transport.

use crate::config::ServerConfig;
use crate::poll::{poll_finish, poll_read, poll_write, PollRegistry};
use crate::transport::{PendingPoll, PendingTransport, PendingWebSocket};
use anyhow::Result;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use wst_core::bridge;
use wst_core::protocol::{POLL_PATH, TOKEN_PARAM};
use wst_core::session::SessionEvent;
use wst_core::token::{TokenError, REJECT_REASON};
use wst_core::{
    AddressToken, AuthContext, BridgeConfig, Endpoint, TunnelError, TunnelResult, TunnelSession,
};

/// What the server needs from an incoming tunnel request.
#[derive(Debug, Clone, Default)]
pub struct TunnelRequest {
    pub token: Option<String>,
    pub identity: Option<String>,
    pub client_ip: String,
}

pub struct TunnelServer {
    auth: AuthContext,
    /// Destination forced on every session.
    lock: Option<Endpoint>,
    connect_timeout: Option<Duration>,
    poll_wait: Duration,
    bridge: BridgeConfig,
    polls: Arc<PollRegistry>,
}

impl TunnelServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            auth: config.auth_context(),
            lock: config.tunnel.clone(),
            connect_timeout: config.connect_timeout(),
            poll_wait: config.poll_wait(),
            bridge: BridgeConfig::default().with_linger(config.linger()),
            polls: Arc::new(PollRegistry::new(config.poll_idle_timeout())),
        }
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn lock(&self) -> Option<&Endpoint> {
        self.lock.as_ref()
    }

    pub fn polls(&self) -> &Arc<PollRegistry> {
        &self.polls
    }

    pub fn poll_wait(&self) -> Duration {
        self.poll_wait
    }

    /// Resolve the destination for a request. A lock wins over any token.
    pub fn authenticate(&self, token: Option<&str>, identity: Option<&str>) -> TunnelResult<Endpoint> {
        if let Some(lock) = &self.lock {
            return Ok(lock.clone());
        }
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(TunnelError::auth(REJECT_REASON));
        };
        AddressToken::decode(token, self.auth.shared_secret.as_deref(), identity).map_err(|e| {
            match e {
                TokenError::Malformed(what) => {
                    TunnelError::malformed(format!("Malformed address token: {}", what))
                }
                TokenError::Rejected => TunnelError::auth(REJECT_REASON),
                TokenError::Auth(err) => TunnelError::auth(REJECT_REASON).with_cause(err),
            }
        })
    }

    /// Open the TCP connection to a resolved destination.
    pub async fn connect_destination(&self, target: &Endpoint) -> TunnelResult<TcpStream> {
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let result = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(TunnelError::timeout(format!(
                        "Tunnel connect error to {}: timed out after {:?}",
                        target, limit
                    ))
                    .with_context("target", target.to_string()))
                }
            },
            None => connect.await,
        };
        result.map_err(|e| {
            TunnelError::destination(format!("Tunnel connect error to {}: {}", target, e))
                .with_context("target", target.to_string())
                .with_cause(e)
        })
    }

    /// Authenticate, connect and accept, or reject with the reason.
    pub async fn dispatch<T: PendingTransport>(
        self: Arc<Self>,
        pending: T,
        request: TunnelRequest,
    ) -> Response {
        let kind = pending.kind();
        let mut session = TunnelSession::new(request.client_ip.clone(), kind, None);

        let outcome = match self.authenticate(request.token.as_deref(), request.identity.as_deref()) {
            Ok(target) => {
                session.target = Some(target.clone());
                self.connect_destination(&target).await.map(|tcp| (target, tcp))
            }
            Err(e) => Err(e),
        };
        let (target, tcp) = match outcome {
            Ok(connected) => connected,
            Err(e) => {
                let _ = session.advance(SessionEvent::DestinationFailed);
                if e.is_rejection() {
                    warn!("Rejecting {} tunnel from {}: {}", kind, request.client_ip, e);
                } else {
                    error!("Cannot serve {} tunnel for {}: {}", kind, request.client_ip, e);
                }
                return pending.reject(StatusCode::INTERNAL_SERVER_ERROR, &e.message);
            }
        };

        info!(
            "Client {} establishing {} tunnel to {}",
            request.client_ip, kind, target
        );
        let bridge_config = self.bridge.clone();
        pending.accept(move |stream| async move {
            let _ = session.advance(SessionEvent::DestinationConnected);
            let report = bridge::bind(stream, tcp, &bridge_config).await;
            let _ = session.advance(SessionEvent::EndpointClosed);
            match report.failure() {
                Some(e) => debug!("Session {} to {} ended: {}", session.id.short(), target, e),
                None => debug!(
                    "Session {} to {} closed ({} bytes up, {} bytes down)",
                    session.id.short(),
                    target,
                    report.a_to_b,
                    report.b_to_a
                ),
            }
        })
    }
}

/// First `X-Forwarded-For` entry, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn router(server: Arc<TunnelServer>) -> Router {
    Router::new()
        .route("/", any(tunnel_handler))
        .route("/health", get(health_handler))
        .route(
            &format!("/{}/:id", POLL_PATH),
            get(poll_read).post(poll_write).delete(poll_finish),
        )
        .with_state(server)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn tunnel_handler(
    State(server): State<Arc<TunnelServer>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let request = TunnelRequest {
        token: params.get(TOKEN_PARAM).cloned(),
        identity: headers
            .get(server.auth().identity_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        client_ip: client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
    };

    match ws {
        Some(upgrade) => server.dispatch(PendingWebSocket::new(upgrade), request).await,
        None if method == Method::POST => {
            let polls = server.polls().clone();
            server.dispatch(PendingPoll::new(polls), request).await
        }
        None => (
            StatusCode::BAD_REQUEST,
            "Expected a WebSocket upgrade or a long-poll open request",
        )
            .into_response(),
    }
}

pub async fn bind(addr: &Endpoint) -> Result<TcpListener> {
    let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
    Ok(listener)
}

/// Serve tunnels on an already bound listener until the server stops.
pub async fn serve(listener: TcpListener, server: Arc<TunnelServer>) -> Result<()> {
    let idle = server.polls().idle_timeout();
    let cleanup = server
        .polls()
        .start_cleanup_task((idle / 2).max(Duration::from_millis(100)));

    let app = router(server);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    cleanup.abort();
    result?;
    Ok(())
}
