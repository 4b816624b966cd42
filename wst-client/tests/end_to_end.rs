//! Client and server wired together over loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use wst_client::{ClientContext, ClientEvent, TunnelClient};
use wst_core::{BridgeConfig, ClientIdentity, Endpoint, ErrorCategory, TransportKind};
use wst_server::{ServerConfig, TunnelServer};

const LIMIT: Duration = Duration::from_secs(10);

/// Destination that echoes everything and half-closes when its input ends.
async fn echo_destination() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    Endpoint::loopback(port)
}

/// Destination that writes `greeting` and closes.
async fn greeting_destination(greeting: &'static [u8]) -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(greeting).await;
            let _ = socket.shutdown().await;
        }
    });
    Endpoint::loopback(port)
}

/// Destination that reads the whole request, then answers and closes.
async fn request_response_destination() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                if socket.read_to_end(&mut request).await.is_ok() {
                    let mut reply = b"RESPONSE:".to_vec();
                    reply.extend_from_slice(&request);
                    let _ = socket.write_all(&reply).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    Endpoint::loopback(port)
}

/// HTTP proxy that serves one CONNECT per connection.
async fn connect_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                let mut request_line = String::new();
                reader.read_line(&mut request_line).await.unwrap();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    if line.trim().is_empty() {
                        break;
                    }
                }
                let parts: Vec<&str> = request_line.split_whitespace().collect();
                assert_eq!(parts[0], "CONNECT");
                let mut upstream = TcpStream::connect(parts[1]).await.unwrap();
                let mut socket = reader.into_inner();
                socket
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
            });
        }
    });
    addr
}

async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> SocketAddr {
    let mut config = ServerConfig::new(Endpoint::loopback(0));
    configure(&mut config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(wst_server::serve(listener, Arc::new(TunnelServer::new(&config))));
    addr
}

fn context(server: SocketAddr, target: Option<Endpoint>) -> ClientContext {
    ClientContext::new(&format!("ws://{}", server), target)
        .unwrap()
        .with_bridge(BridgeConfig::default().with_linger(Duration::from_secs(2)))
}

async fn start_client(ctx: ClientContext) -> (SocketAddr, UnboundedReceiver<ClientEvent>) {
    let (client, events) = TunnelClient::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { client.serve(listener).await });
    (addr, events)
}

/// Send `payload` through the tunnel while reading the echo back.
async fn round_trip(local: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let app = TcpStream::connect(local).await.unwrap();
    let (mut reader, mut writer) = app.into_split();
    let outgoing = payload.to_vec();
    let sender = tokio::spawn(async move {
        writer.write_all(&outgoing).await.unwrap();
        writer
    });
    let mut echoed = vec![0u8; payload.len()];
    timeout(LIMIT, reader.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    drop(sender.await.unwrap());
    echoed
}

#[tokio::test]
async fn websocket_tunnel_round_trip() {
    let target = echo_destination().await;
    let server = start_server(|_| {}).await;
    let (local, mut events) = start_client(context(server, Some(target))).await;

    assert_eq!(round_trip(local, b"hello tunnel").await, b"hello tunnel");
    match timeout(LIMIT, events.recv()).await.unwrap().unwrap() {
        ClientEvent::TunnelEstablished { kind, .. } => assert_eq!(kind, TransportKind::WebSocket),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn long_poll_tunnel_round_trip() {
    let target = echo_destination().await;
    let server = start_server(|_| {}).await;
    let ctx = context(server, Some(target)).with_transport(TransportKind::HttpPoll);
    let (local, mut events) = start_client(ctx).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(round_trip(local, &payload).await, payload);
    match timeout(LIMIT, events.recv()).await.unwrap().unwrap() {
        ClientEvent::TunnelEstablished { kind, .. } => assert_eq!(kind, TransportKind::HttpPoll),
        other => panic!("unexpected event: {:?}", other),
    }
}

async fn half_closed_request_gets_reply(kind: TransportKind) {
    let target = request_response_destination().await;
    let server = start_server(|_| {}).await;
    let ctx = context(server, Some(target)).with_transport(kind);
    let (local, mut events) = start_client(ctx).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    app.write_all(b"GET /").await.unwrap();
    app.shutdown().await.unwrap();
    let mut reply = Vec::new();
    timeout(LIMIT, app.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"RESPONSE:GET /");

    loop {
        match timeout(LIMIT, events.recv()).await.unwrap().unwrap() {
            ClientEvent::TunnelClosed { report, .. } => {
                assert_eq!(report.a_to_b, 5);
                assert_eq!(report.b_to_a, 14);
                break;
            }
            ClientEvent::ConnectFailed { error, .. } => panic!("connect failed: {}", error),
            ClientEvent::TunnelEstablished { .. } => {}
        }
    }
}

#[tokio::test]
async fn websocket_half_close_still_delivers_reply() {
    half_closed_request_gets_reply(TransportKind::WebSocket).await;
}

#[tokio::test]
async fn long_poll_half_close_still_delivers_reply() {
    half_closed_request_gets_reply(TransportKind::HttpPoll).await;
}

#[tokio::test]
async fn websocket_tunnel_through_http_proxy() {
    let target = echo_destination().await;
    let server = start_server(|_| {}).await;
    let proxy = connect_proxy().await;
    let ctx = context(server, Some(target))
        .with_proxy(url::Url::parse(&format!("http://{}", proxy)).unwrap());
    let (local, _events) = start_client(ctx).await;

    assert_eq!(round_trip(local, b"via proxy").await, b"via proxy");
}

#[tokio::test]
async fn server_lock_overrides_requested_destination() {
    let locked = greeting_destination(b"locked").await;
    let server = start_server(|config| config.tunnel = Some(locked)).await;
    let (local, _events) =
        start_client(context(server, Some(Endpoint::new("otherhost", 9999)))).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    let mut received = Vec::new();
    timeout(LIMIT, app.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"locked");
}

#[tokio::test]
async fn locked_server_needs_no_token() {
    let locked = greeting_destination(b"db").await;
    let server = start_server(|config| config.tunnel = Some(locked)).await;
    let (local, _events) = start_client(context(server, None)).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    let mut received = Vec::new();
    timeout(LIMIT, app.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"db");
}

#[tokio::test]
async fn signed_destination_accepted_with_matching_secret() {
    let target = echo_destination().await;
    let server = start_server(|config| config.auth_key = Some("s3cret".to_string())).await;
    let ctx = context(server, Some(target))
        .with_auth_key("s3cret")
        .with_identity(ClientIdentity::from("abc123"));
    let (local, _events) = start_client(ctx).await;

    assert_eq!(round_trip(local, b"signed").await, b"signed");
}

#[tokio::test]
async fn wrong_secret_is_rejected_with_reason() {
    let target = echo_destination().await;
    let server = start_server(|config| config.auth_key = Some("other".to_string())).await;
    let ctx = context(server, Some(target))
        .with_auth_key("s3cret")
        .with_transport(TransportKind::HttpPoll);
    let (local, mut events) = start_client(ctx).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    match timeout(LIMIT, events.recv()).await.unwrap().unwrap() {
        ClientEvent::ConnectFailed { error, .. } => {
            assert_eq!(error.category, ErrorCategory::TransportConnect);
            assert!(
                error.message.contains("Unable to determine tunnel target"),
                "{}",
                error.message
            );
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // The local connection is closed, not retried.
    let mut rest = Vec::new();
    let n = timeout(LIMIT, app.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn unsigned_request_rejected_over_websocket() {
    let target = echo_destination().await;
    let server = start_server(|config| config.auth_key = Some("s3cret".to_string())).await;
    let (local, mut events) = start_client(context(server, Some(target))).await;

    let _app = TcpStream::connect(local).await.unwrap();
    match timeout(LIMIT, events.recv()).await.unwrap().unwrap() {
        ClientEvent::ConnectFailed { error, .. } => {
            assert!(wst_client::tunnel::is_rejected(&error));
            assert!(error.message.contains("500"), "{}", error.message);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn destination_refused_is_reported() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = dead.local_addr().unwrap().port();
    drop(dead);

    let server = start_server(|_| {}).await;
    let ctx = context(server, Some(Endpoint::loopback(port))).with_transport(TransportKind::HttpPoll);
    let (local, mut events) = start_client(ctx).await;

    let _app = TcpStream::connect(local).await.unwrap();
    match timeout(LIMIT, events.recv()).await.unwrap().unwrap() {
        ClientEvent::ConnectFailed { error, .. } => {
            assert!(
                error
                    .message
                    .contains(&format!("Tunnel connect error to 127.0.0.1:{}", port)),
                "{}",
                error.message
            );
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn fifty_concurrent_sessions_are_independent() {
    let target = echo_destination().await;
    let server = start_server(|_| {}).await;
    let (local, _events) = start_client(context(server, Some(target))).await;

    let mut apps = Vec::new();
    for i in 0..50u32 {
        let mut app = TcpStream::connect(local).await.unwrap();
        let msg = format!("session-{:02}", i);
        app.write_all(msg.as_bytes()).await.unwrap();
        apps.push((app, msg));
    }
    for (app, msg) in apps.iter_mut() {
        let mut buf = vec![0u8; msg.len()];
        timeout(LIMIT, app.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, msg.as_bytes());
    }

    // Closing one session leaves the rest working.
    let (first, _) = apps.remove(0);
    drop(first);
    for (app, msg) in apps.iter_mut() {
        let again = format!("{}-again", msg);
        app.write_all(again.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; again.len()];
        timeout(LIMIT, app.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, again.as_bytes());
    }
}

#[tokio::test]
async fn destination_close_reaches_local_app_after_data() {
    let target = greeting_destination(b"bye").await;
    let server = start_server(|_| {}).await;
    let (local, _events) = start_client(context(server, Some(target))).await;

    let mut app = TcpStream::connect(local).await.unwrap();
    let mut received = Vec::new();
    timeout(LIMIT, app.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"bye");
}

#[tokio::test]
async fn stdio_mode_relays_both_ways() {
    let target = echo_destination().await;
    let server = start_server(|_| {}).await;
    let (client, mut events) = TunnelClient::new(context(server, Some(target)));

    let (mut app_in, input) = tokio::io::duplex(1024);
    let (output, mut app_out) = tokio::io::duplex(1024);
    let stdio = tokio::spawn(async move { client.run_stdio(input, output).await });

    app_in.write_all(b"ssh-banner\r\n").await.unwrap();
    let mut echoed = [0u8; 12];
    timeout(LIMIT, app_out.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ssh-banner\r\n");

    // End of input closes the tunnel and ends the stdio session.
    drop(app_in);
    timeout(LIMIT, stdio).await.unwrap().unwrap().unwrap();

    match events.recv().await.unwrap() {
        ClientEvent::TunnelEstablished { local, kind, .. } => {
            assert_eq!(local, "stdio");
            assert_eq!(kind, TransportKind::WebSocket);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match events.recv().await.unwrap() {
        ClientEvent::TunnelClosed { report, .. } => {
            assert_eq!(report.a_to_b, 12);
            assert_eq!(report.b_to_a, 12);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn stdio_mode_reports_connect_failure() {
    let server = start_server(|_| {}).await;
    // No destination and no lock: the server cannot pick a target.
    let (client, mut events) = TunnelClient::new(context(server, None));
    let (_app_in, input) = tokio::io::duplex(64);
    let (output, _app_out) = tokio::io::duplex(64);

    let err = timeout(LIMIT, client.run_stdio(input, output))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::TransportConnect);

    match events.recv().await.unwrap() {
        ClientEvent::ConnectFailed { local, error, .. } => {
            assert_eq!(local, "stdio");
            assert_eq!(error.category, ErrorCategory::TransportConnect);
            assert!(wst_client::tunnel::is_rejected(&error));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn health_endpoint() {
    let server = start_server(|_| {}).await;
    let body = reqwest::get(format!("http://{}/health", server))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}
