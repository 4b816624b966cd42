//! HTTP long-poll sessions.
//!
//! An accepted long-poll tunnel is an in-memory pipe registered under a
//! session id. Clients drain the downstream direction with held `GET`
//! requests, push upstream bytes with `POST` and end the upstream
//! direction with `DELETE`.

use crate::tunnel::TunnelServer;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use wst_core::transport::TRANSPORT_BUFFER;
use wst_core::SessionId;

/// Outcome of one downstream read.
#[derive(Debug, PartialEq, Eq)]
pub enum PollRead {
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Empty,
    /// The session's downstream direction is finished.
    Ended,
}

pub struct PollSession {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
    last_seen: std::sync::Mutex<Instant>,
}

impl PollSession {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            last_seen: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last_seen| last_seen.elapsed())
            .unwrap_or_default()
    }

    /// Wait up to `wait` for downstream bytes.
    pub async fn read(&self, wait: Duration) -> PollRead {
        self.touch();
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; TRANSPORT_BUFFER];
        let result = tokio::time::timeout(wait, reader.read(&mut buf)).await;
        self.touch();
        match result {
            Err(_) => PollRead::Empty,
            Ok(Ok(0)) | Ok(Err(_)) => PollRead::Ended,
            Ok(Ok(n)) => {
                buf.truncate(n);
                PollRead::Data(buf)
            }
        }
    }

    /// Push upstream bytes.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.touch();
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// End the upstream direction.
    pub async fn finish(&self) -> io::Result<()> {
        self.touch();
        self.writer.lock().await.shutdown().await
    }
}

/// Open long-poll sessions by id.
pub struct PollRegistry {
    sessions: DashMap<SessionId, Arc<PollSession>>,
    idle_timeout: Duration,
}

impl PollRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Register the transport side of a new session.
    pub fn open(&self, stream: DuplexStream) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(id, Arc::new(PollSession::new(stream)));
        debug!("Long-poll session {} opened", id.short());
        id
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<PollSession>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions nobody has touched within the idle timeout. Dropping a
    /// session closes its pipe, which ends the bridge behind it.
    pub fn reap_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.idle_for() < self.idle_timeout);
        let reaped = before.saturating_sub(self.sessions.len());
        if reaped > 0 {
            debug!("Reaped {} idle long-poll sessions", reaped);
        }
        reaped
    }

    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.reap_idle();
            }
        })
    }
}

fn lookup(server: &TunnelServer, id: &str) -> Result<(SessionId, Arc<PollSession>), Response> {
    let id: SessionId = id
        .parse()
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    server
        .polls()
        .get(&id)
        .map(|session| (id, session))
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())
}

/// `GET /_httptunnel/:id`
pub async fn poll_read(
    State(server): State<Arc<TunnelServer>>,
    Path(id): Path<String>,
) -> Response {
    let (id, session) = match lookup(&server, &id) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match session.read(server.poll_wait()).await {
        PollRead::Data(data) => {
            trace!("Long-poll {} down {} bytes", id.short(), data.len());
            (StatusCode::OK, data).into_response()
        }
        PollRead::Empty => StatusCode::NO_CONTENT.into_response(),
        PollRead::Ended => {
            server.polls().remove(&id);
            debug!("Long-poll session {} ended", id.short());
            StatusCode::GONE.into_response()
        }
    }
}

/// `POST /_httptunnel/:id`
pub async fn poll_write(
    State(server): State<Arc<TunnelServer>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let (id, session) = match lookup(&server, &id) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match session.write(&body).await {
        Ok(()) => {
            trace!("Long-poll {} up {} bytes", id.short(), body.len());
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            debug!("Long-poll {} write failed: {}", id.short(), e);
            StatusCode::GONE.into_response()
        }
    }
}

/// `DELETE /_httptunnel/:id`
pub async fn poll_finish(
    State(server): State<Arc<TunnelServer>>,
    Path(id): Path<String>,
) -> Response {
    let (id, session) = match lookup(&server, &id) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match session.finish().await {
        Ok(()) => {
            debug!("Long-poll {} upstream finished", id.short());
            StatusCode::NO_CONTENT.into_response()
        }
        Err(_) => StatusCode::GONE.into_response(),
    }
}
