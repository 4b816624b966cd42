//! Client sessions: one transport per accepted local connection.
//!
//! Every session builds the address token, makes exactly one transport
//! attempt and, on success, bridges the local stream with it. Failures are
//! reported through [`ClientEvent`] and never retried.

use crate::config::ClientConfig;
use crate::transport::{connect_http, connect_websocket};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;
use wst_core::auth::DEFAULT_IDENTITY_HEADER;
use wst_core::bridge;
use wst_core::protocol::{POLL_PATH, TOKEN_PARAM};
use wst_core::session::SessionEvent;
use wst_core::{
    AddressToken, BridgeConfig, BridgeReport, ClientIdentity, Endpoint, ErrorCategory, SessionId,
    TransportConnection, TransportKind, TunnelError, TunnelResult, TunnelSession, TunnelSpec,
};

/// Default bound on the transport handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed `accept` before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a session needs to reach the server. Shared, read-only, by
/// all sessions of one client process.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub server_url: Url,
    /// Destination requested from the server; `None` relies on a locked server.
    pub target: Option<Endpoint>,
    pub auth_key: Option<String>,
    /// Generated once per process.
    pub identity: ClientIdentity,
    pub identity_header: String,
    pub extra_headers: Vec<(String, String)>,
    pub transport: TransportKind,
    pub connect_timeout: Option<Duration>,
    /// Skip server certificate verification.
    pub accept_any_cert: bool,
    /// HTTP proxy the transport is opened through.
    pub proxy: Option<Url>,
    pub bridge: BridgeConfig,
}

impl ClientContext {
    pub fn new(server: &str, target: Option<Endpoint>) -> TunnelResult<Self> {
        let server_url = Url::parse(server)
            .map_err(|e| TunnelError::config(format!("Invalid server URL {}: {}", server, e)))?;
        match server_url.scheme() {
            "ws" | "wss" | "http" | "https" => {}
            other => {
                return Err(TunnelError::config(format!(
                    "Unsupported server URL scheme: {}",
                    other
                )))
            }
        }

        Ok(Self {
            server_url,
            target,
            auth_key: None,
            identity: ClientIdentity::generate(),
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            extra_headers: Vec::new(),
            transport: TransportKind::WebSocket,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            accept_any_cert: false,
            proxy: None,
            bridge: BridgeConfig::default(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> TunnelResult<Self> {
        let mut ctx = Self::new(&config.server, config.tunnel.remote().cloned())?
            .with_identity_header(&config.identity_header)
            .with_headers(config.extra_headers())
            .with_connect_timeout(config.connect_timeout())
            .with_any_cert(config.any_cert);
        if let Some(proxy) = &config.proxy {
            ctx = ctx.with_proxy(proxy.clone());
        }
        ctx.auth_key = config.auth_key.clone().filter(|k| !k.is_empty());
        ctx.bridge = BridgeConfig::default().with_linger(config.linger());
        if config.http_only {
            ctx.transport = TransportKind::HttpPoll;
        }
        Ok(ctx)
    }

    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_identity_header(mut self, name: impl Into<String>) -> Self {
        self.identity_header = name.into();
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_any_cert(mut self, accept: bool) -> Self {
        self.accept_any_cert = accept;
        self
    }

    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// The `tkn` value for this client's destination, if it requests one.
    pub fn token(&self) -> TunnelResult<Option<String>> {
        let Some(target) = &self.target else {
            return Ok(None);
        };
        AddressToken::encode(target, self.auth_key.as_deref(), Some(self.identity.as_str()))
            .map(Some)
            .map_err(|e| TunnelError::config(format!("Cannot sign destination: {}", e)))
    }

    /// Server URL with the scheme for `kind`, credentials stripped and a
    /// trailing slash on the path.
    fn base_url(&self, kind: TransportKind) -> TunnelResult<Url> {
        let mut url = self.server_url.clone();
        let secure = matches!(url.scheme(), "wss" | "https");
        let scheme = match (kind, secure) {
            (TransportKind::WebSocket, false) => "ws",
            (TransportKind::WebSocket, true) => "wss",
            (TransportKind::HttpPoll, false) => "http",
            (TransportKind::HttpPoll, true) => "https",
        };
        url.set_scheme(scheme)
            .map_err(|_| TunnelError::config(format!("Cannot use {} with {}", scheme, url)))?;
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_query(None);
        url.set_fragment(None);
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// URL of the initial transport request, carrying the token.
    pub fn tunnel_url(&self, kind: TransportKind) -> TunnelResult<Url> {
        let mut url = self.base_url(kind)?;
        if let Some(token) = self.token()? {
            url.query_pairs_mut().append_pair(TOKEN_PARAM, &token);
        }
        Ok(url)
    }

    /// URL of an open long-poll session.
    pub fn poll_session_url(&self, session: &str) -> TunnelResult<Url> {
        self.base_url(TransportKind::HttpPoll)?
            .join(&format!("{}/{}", POLL_PATH, session))
            .map_err(|e| TunnelError::config(format!("Invalid session URL: {}", e)))
    }

    /// Operator headers, then the identity header, then Basic auth from the
    /// URL credentials. The identity header replaces any operator header of
    /// the same name.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .extra_headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(&self.identity_header))
            .cloned()
            .collect();
        headers.push((
            self.identity_header.clone(),
            self.identity.as_str().to_string(),
        ));
        if let Some(auth) = self.basic_auth() {
            headers.push(("Authorization".to_string(), auth));
        }
        headers
    }

    fn basic_auth(&self) -> Option<String> {
        let user = self.server_url.username();
        if user.is_empty() {
            return None;
        }
        let credentials = match self.server_url.password() {
            Some(password) => format!("{}:{}", user, password),
            None => user.to_string(),
        };
        Some(format!("Basic {}", STANDARD.encode(credentials)))
    }
}

/// Session notifications, in the order they happen for a given session.
#[derive(Debug)]
pub enum ClientEvent {
    TunnelEstablished {
        session: SessionId,
        local: String,
        kind: TransportKind,
    },
    ConnectFailed {
        session: SessionId,
        local: String,
        error: TunnelError,
    },
    TunnelClosed {
        session: SessionId,
        report: BridgeReport,
    },
}

#[derive(Clone)]
pub struct TunnelClient {
    ctx: Arc<ClientContext>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl TunnelClient {
    pub fn new(ctx: ClientContext) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                ctx: Arc::new(ctx),
                events,
            },
            rx,
        )
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Bind the local listener.
    pub async fn bind(local: &Endpoint) -> TunnelResult<TcpListener> {
        TcpListener::bind((local.host.as_str(), local.port))
            .await
            .map_err(|e| {
                TunnelError::config(format!("Cannot listen on {}: {}", local, e)).with_cause(e)
            })
    }

    /// Bind `local` and serve it until the listener fails.
    pub async fn start(&self, local: &Endpoint) -> TunnelResult<()> {
        let listener = Self::bind(local).await?;
        self.serve(listener).await
    }

    /// Accept local connections forever, one session task each.
    pub async fn serve(&self, listener: TcpListener) -> TunnelResult<()> {
        loop {
            let (socket, peer) = accept_next(|| listener.accept()).await;
            let client = self.clone();
            tokio::spawn(async move {
                client.handle_connection(socket, peer).await;
            });
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let mut session = TunnelSession::new(
            peer.to_string(),
            self.ctx.transport,
            self.ctx.target.clone(),
        );
        debug!("Session {} accepted from {}", session.id.short(), peer);

        let connection = match self.open_transport().await {
            Ok(connection) => connection,
            Err(error) => {
                let _ = session.advance(SessionEvent::TransportFailed);
                drop(socket);
                self.emit(ClientEvent::ConnectFailed {
                    session: session.id,
                    local: session.local,
                    error,
                });
                return;
            }
        };

        let _ = session.advance(SessionEvent::TransportEstablished);
        self.emit(ClientEvent::TunnelEstablished {
            session: session.id,
            local: session.local.clone(),
            kind: connection.kind,
        });

        let report = bridge::bind(socket, connection.stream, &self.ctx.bridge).await;
        let _ = session.advance(SessionEvent::EndpointClosed);
        self.emit(ClientEvent::TunnelClosed {
            session: session.id,
            report,
        });
    }

    /// Bridge a single input/output pair (normally the process's standard
    /// streams). Returns once the bridge has closed; the outcome is also
    /// reported through the event channel.
    pub async fn run_stdio<R, W>(&self, input: R, output: W) -> TunnelResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut session = TunnelSession::new("stdio", self.ctx.transport, self.ctx.target.clone());
        let connection = match self.open_transport().await {
            Ok(connection) => connection,
            Err(error) => {
                let _ = session.advance(SessionEvent::TransportFailed);
                let mut result = TunnelError::new(error.category, error.message.clone());
                result.context = error.context.clone();
                self.emit(ClientEvent::ConnectFailed {
                    session: session.id,
                    local: session.local,
                    error,
                });
                return Err(result);
            }
        };
        let _ = session.advance(SessionEvent::TransportEstablished);
        self.emit(ClientEvent::TunnelEstablished {
            session: session.id,
            local: session.local.clone(),
            kind: connection.kind,
        });

        let (transport_read, transport_write) = tokio::io::split(connection.stream);
        let report = bridge::bind_split(
            input,
            output,
            transport_read,
            transport_write,
            &self.ctx.bridge,
        )
        .await;
        let _ = session.advance(SessionEvent::EndpointClosed);
        self.emit(ClientEvent::TunnelClosed {
            session: session.id,
            report,
        });
        Ok(())
    }

    /// Make the single transport attempt for a session.
    pub async fn open_transport(&self) -> TunnelResult<TransportConnection> {
        let kind = self.ctx.transport;
        let connect = async {
            match kind {
                TransportKind::WebSocket => connect_websocket(&self.ctx).await,
                TransportKind::HttpPoll => connect_http(&self.ctx).await,
            }
        };
        let stream = match self.ctx.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                TunnelError::timeout(format!(
                    "Transport handshake timed out after {:?}",
                    limit
                ))
            })??,
            None => connect.await?,
        };
        Ok(TransportConnection::new(kind, stream))
    }
}

/// Wait for the next connection from `accept`, backing off after failures
/// such as running out of file descriptors.
pub async fn accept_next<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("Failed to accept local connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Where a parsed `--tunnel` argument binds locally, if anywhere.
pub fn local_endpoint(spec: &TunnelSpec) -> Option<&Endpoint> {
    match spec {
        TunnelSpec::Listen { local, .. } => Some(local),
        TunnelSpec::Stdio { .. } => None,
    }
}

/// Whether an error came from the server refusing the tunnel.
pub fn is_rejected(error: &TunnelError) -> bool {
    error.category == ErrorCategory::TransportConnect && error.context_value("status").is_some()
}
