//! Transport connections: the duplex byte stream carried over a WebSocket
//! or an HTTP long-poll tunnel.
//!
//! Both carriers are turned into a plain [`DuplexStream`] by a background
//! pump task, so session and bridge logic never see transport framing.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, trace};

/// Capacity of the in-memory pipe between a transport pump and its session.
pub const TRANSPORT_BUFFER: usize = 64 * 1024;

/// Largest payload placed in a single WebSocket frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// How long a pump keeps reading after its outbound side has closed.
pub const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// The carrier a transport connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    HttpPoll,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "ws"),
            TransportKind::HttpPoll => write!(f, "http"),
        }
    }
}

/// An established transport, ready to be bridged.
#[derive(Debug)]
pub struct TransportConnection {
    pub kind: TransportKind,
    pub stream: DuplexStream,
}

impl TransportConnection {
    pub fn new(kind: TransportKind, stream: DuplexStream) -> Self {
        Self { kind, stream }
    }
}

/// A WebSocket message reduced to what the tunnel cares about.
#[derive(Debug)]
pub enum Frame {
    Data(Vec<u8>),
    Close,
    /// Ping/pong and other control traffic.
    Control,
}

/// Maps a WebSocket library's message type onto tunnel frames.
///
/// Implemented by zero-sized marker types in the client (tungstenite) and
/// server (axum).
pub trait FrameCodec: Send + 'static {
    type Message: Send + 'static;

    fn binary(data: Vec<u8>) -> Self::Message;
    fn close() -> Self::Message;
    fn classify(message: Self::Message) -> Frame;
}

/// Turn a WebSocket into a byte stream.
///
/// Bytes written to the returned stream are sent as binary frames; data
/// frames received are readable from it. End of input travels in-band as an
/// empty data frame, so each direction can finish on its own. The close
/// frame is sent once both directions are done.
pub fn websocket_stream<C, S, E>(socket: S) -> DuplexStream
where
    C: FrameCodec,
    S: Stream<Item = Result<C::Message, E>> + Sink<C::Message> + Send + 'static,
    <S as Sink<C::Message>>::Error: fmt::Display,
    E: fmt::Display + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(TRANSPORT_BUFFER);
    tokio::spawn(pump_websocket::<C, S, E>(socket, remote));
    local
}

async fn pump_websocket<C, S, E>(socket: S, remote: DuplexStream)
where
    C: FrameCodec,
    S: Stream<Item = Result<C::Message, E>> + Sink<C::Message> + Send,
    <S as Sink<C::Message>>::Error: fmt::Display,
    E: fmt::Display,
{
    let (mut reader, mut writer) = tokio::io::split(remote);
    let (mut sink, mut stream) = socket.split();

    {
        let outbound = async {
            let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        trace!("ws send {} bytes", n);
                        if let Err(e) = sink.send(C::binary(buf[..n].to_vec())).await {
                            debug!("WebSocket send failed: {}", e);
                            return;
                        }
                    }
                }
            }
            trace!("ws send end of input");
            if let Err(e) = sink.send(C::binary(Vec::new())).await {
                debug!("WebSocket send failed: {}", e);
            }
        };

        let inbound = async {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(message) => match C::classify(message) {
                        Frame::Data(data) if data.is_empty() => {
                            trace!("ws peer reached end of input");
                            break;
                        }
                        Frame::Data(data) => {
                            trace!("ws recv {} bytes", data.len());
                            if writer.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Frame::Close => break,
                        Frame::Control => {}
                    },
                    Err(e) => {
                        debug!("WebSocket receive failed: {}", e);
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        };

        tokio::pin!(outbound);
        tokio::pin!(inbound);
        tokio::select! {
            _ = &mut outbound => {
                let _ = tokio::time::timeout(CLOSE_GRACE, &mut inbound).await;
            }
            _ = &mut inbound => {
                // The session drops its end once it is done, which ends `outbound`.
                outbound.await;
            }
        }
    }

    let _ = sink.send(C::close()).await;
    let _ = sink.close().await;
}
