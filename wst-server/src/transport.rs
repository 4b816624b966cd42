//! Pending transports: a tunnel request that has not been answered yet.
//!
//! A pending transport is either accepted (the handshake completes and the
//! resulting byte stream is handed to the session) or rejected with an
//! HTTP status and a reason.

use crate::poll::PollRegistry;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::sync::Arc;
use tokio::io::DuplexStream;
use wst_core::protocol::{rejection_body, PollOpened, SUBPROTOCOL};
use wst_core::transport::{websocket_stream, Frame, FrameCodec, TRANSPORT_BUFFER};
use wst_core::TransportKind;

/// axum WebSocket messages as tunnel frames.
pub struct AxumFrames;

impl FrameCodec for AxumFrames {
    type Message = Message;

    fn binary(data: Vec<u8>) -> Message {
        Message::Binary(data)
    }

    fn close() -> Message {
        Message::Close(None)
    }

    fn classify(message: Message) -> Frame {
        match message {
            Message::Binary(data) => Frame::Data(data),
            Message::Text(text) => Frame::Data(text.into_bytes()),
            Message::Close(_) => Frame::Close,
            Message::Ping(_) | Message::Pong(_) => Frame::Control,
        }
    }
}

pub trait PendingTransport: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Complete the handshake. `on_ready` runs with the transport stream
    /// once it is usable.
    fn accept<F, Fut>(self, on_ready: F) -> Response
    where
        F: FnOnce(DuplexStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    /// Refuse the request with `status`, carrying `reason` in the body.
    fn reject(self, status: StatusCode, reason: &str) -> Response
    where
        Self: Sized,
    {
        rejection(status, reason)
    }
}

/// Error response whose body is the JSON-encoded reason.
pub fn rejection(status: StatusCode, reason: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        rejection_body(reason),
    )
        .into_response()
}

/// A WebSocket upgrade request.
pub struct PendingWebSocket {
    upgrade: WebSocketUpgrade,
}

impl PendingWebSocket {
    pub fn new(upgrade: WebSocketUpgrade) -> Self {
        Self { upgrade }
    }
}

impl PendingTransport for PendingWebSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn accept<F, Fut>(self, on_ready: F) -> Response
    where
        F: FnOnce(DuplexStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.upgrade
            .protocols([SUBPROTOCOL])
            .on_upgrade(move |socket| async move {
                let stream = websocket_stream::<AxumFrames, _, _>(socket);
                on_ready(stream).await;
            })
    }
}

/// A long-poll open request.
pub struct PendingPoll {
    registry: Arc<PollRegistry>,
}

impl PendingPoll {
    pub fn new(registry: Arc<PollRegistry>) -> Self {
        Self { registry }
    }
}

impl PendingTransport for PendingPoll {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpPoll
    }

    fn accept<F, Fut>(self, on_ready: F) -> Response
    where
        F: FnOnce(DuplexStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (local, remote) = tokio::io::duplex(TRANSPORT_BUFFER);
        let session = self.registry.open(remote);
        match (PollOpened { session }).to_bytes() {
            Ok(body) => {
                tokio::spawn(on_ready(local));
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response()
            }
            Err(e) => {
                self.registry.remove(&session);
                rejection(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollRead;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_axum_frames() {
        assert!(matches!(
            AxumFrames::classify(Message::Binary(vec![7])),
            Frame::Data(d) if d == vec![7]
        ));
        assert!(matches!(AxumFrames::classify(Message::Pong(vec![])), Frame::Control));
        assert!(matches!(AxumFrames::classify(Message::Close(None)), Frame::Close));
    }

    #[tokio::test]
    async fn test_rejection_body_is_json_reason() {
        let response = rejection(StatusCode::INTERNAL_SERVER_ERROR, "no route");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"\"no route\"");
    }

    #[tokio::test]
    async fn test_poll_accept_registers_session() {
        let registry = Arc::new(PollRegistry::new(Duration::from_millis(50)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let response = PendingPoll::new(registry.clone()).accept(move |mut stream| async move {
            stream.write_all(b"ready").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            let _ = tx.send(buf);
        });
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let opened = PollOpened::from_bytes(&body).unwrap();
        assert_eq!(registry.len(), 1);

        let session = registry.get(&opened.session).unwrap();
        assert_eq!(
            session.read(Duration::from_secs(1)).await,
            PollRead::Data(b"ready".to_vec())
        );
        session.write(b"ping").await.unwrap();
        assert_eq!(&rx.await.unwrap(), b"ping");
    }
}
