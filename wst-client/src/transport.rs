//! Outbound transports: the WebSocket handshake and the HTTP long-poll carrier.
//!
//! Both return a [`DuplexStream`]; framing is handled by background pumps.
//! Either can go through an HTTP proxy and skip certificate checks.

use crate::tunnel::ClientContext;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{self as ws_header, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async_tls_with_config, Connector};
use tracing::{debug, trace};
use url::Url;
use wst_core::error::{ErrorCategory, ResultExt};
use wst_core::protocol::{parse_rejection, PollOpened, SUBPROTOCOL};
use wst_core::transport::{
    websocket_stream, Frame, FrameCodec, CLOSE_GRACE, MAX_FRAME_PAYLOAD, TRANSPORT_BUFFER,
};
use wst_core::{TransportKind, TunnelError, TunnelResult};

/// tungstenite messages as tunnel frames.
pub struct TungsteniteFrames;

impl FrameCodec for TungsteniteFrames {
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
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
        }
    }
}

/// Perform the WebSocket handshake for one session.
pub async fn connect_websocket(ctx: &ClientContext) -> TunnelResult<DuplexStream> {
    let url = ctx.tunnel_url(TransportKind::WebSocket)?;
    debug!("Opening WebSocket tunnel to {}", redact(&url));

    let mut request = url
        .as_str()
        .into_client_request()
        .with_category(ErrorCategory::Configuration)?;
    let headers = request.headers_mut();
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        ws_header::HeaderValue::from_static(SUBPROTOCOL),
    );
    for (name, value) in ctx.request_headers() {
        let name = ws_header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TunnelError::config(format!("Invalid header name: {}", name)))?;
        let value = ws_header::HeaderValue::from_str(&value)
            .map_err(|_| TunnelError::config(format!("Invalid value for header {}", name)))?;
        headers.insert(name, value);
    }

    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::config(format!("Server URL has no host: {}", redact(&url))))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TunnelError::config(format!("Server URL has no port: {}", redact(&url))))?;
    let tcp = match &ctx.proxy {
        Some(proxy) => connect_via_proxy(proxy, host, port).await?,
        None => TcpStream::connect((bare_host(host), port)).await.map_err(|e| {
            TunnelError::transport(format!("WebSocket connect failed: {}", e)).with_cause(e)
        })?,
    };
    let _ = tcp.set_nodelay(true);

    let connector = ctx.accept_any_cert.then(any_cert_connector);
    let (socket, response) = client_async_tls_with_config(request, tcp, None, connector)
        .await
        .map_err(websocket_error)?;
    debug!("WebSocket handshake complete ({})", response.status());

    Ok(websocket_stream::<TungsteniteFrames, _, _>(socket))
}

/// IPv6 literals come bracketed out of URLs.
fn bare_host(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Largest proxy response head accepted for a CONNECT.
const MAX_PROXY_HEAD: usize = 8 * 1024;

/// Open a TCP tunnel to `host:port` with an HTTP `CONNECT` through `proxy`.
pub async fn connect_via_proxy(proxy: &Url, host: &str, port: u16) -> TunnelResult<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| TunnelError::config(format!("Proxy URL has no host: {}", proxy)))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);
    let mut stream = TcpStream::connect((bare_host(proxy_host), proxy_port))
        .await
        .map_err(|e| {
            TunnelError::transport(format!("Cannot reach proxy {}:{}: {}", proxy_host, proxy_port, e))
                .with_cause(e)
        })?;

    let authority = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .with_category(ErrorCategory::TransportConnect)?;

    // Byte by byte so nothing past the head is consumed.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_HEAD {
            return Err(TunnelError::transport("Proxy response head too large"));
        }
        let n = stream
            .read(&mut byte)
            .await
            .with_category(ErrorCategory::TransportConnect)?;
        if n == 0 {
            return Err(TunnelError::transport(format!(
                "Proxy closed the connection during CONNECT to {}",
                authority
            )));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some(status) if status.starts_with('2') => {
            debug!("Proxy {} opened tunnel to {}", proxy_host, authority);
            Ok(stream)
        }
        _ => Err(TunnelError::transport(format!(
            "Proxy refused CONNECT to {}: {}",
            authority, status_line
        ))
        .with_context("proxy", proxy_host.to_string())),
    }
}

/// TLS connector that accepts any server certificate.
fn any_cert_connector() -> Connector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Connector::Rustls(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn websocket_error(err: tungstenite::Error) -> TunnelError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let reason = response
                .body()
                .as_deref()
                .map(parse_rejection)
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| status.to_string());
            TunnelError::transport(format!("Server rejected tunnel ({}): {}", status, reason))
                .with_context("status", status.as_u16().to_string())
        }
        other => TunnelError::transport(format!("WebSocket connect failed: {}", other))
            .with_cause(other),
    }
}

/// Open a long-poll session and start pumping it.
pub async fn connect_http(ctx: &ClientContext) -> TunnelResult<DuplexStream> {
    let open_url = ctx.tunnel_url(TransportKind::HttpPoll)?;
    debug!("Opening long-poll tunnel to {}", redact(&open_url));

    let mut headers = HeaderMap::new();
    for (name, value) in ctx.request_headers() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TunnelError::config(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| TunnelError::config(format!("Invalid value for header {}", name)))?;
        headers.insert(name, value);
    }
    let client = http_client(ctx, headers)?;

    let response = client
        .post(open_url)
        .send()
        .await
        .map_err(|e| TunnelError::transport(format!("Long-poll open failed: {}", e)).with_cause(e))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .with_category(ErrorCategory::TransportConnect)?;
    if !status.is_success() {
        return Err(TunnelError::transport(format!(
            "Server rejected tunnel ({}): {}",
            status,
            parse_rejection(&body)
        ))
        .with_context("status", status.as_u16().to_string()));
    }
    let opened = PollOpened::from_bytes(&body).with_category(ErrorCategory::TransportConnect)?;
    let session_url = ctx.poll_session_url(&opened.session.to_string())?;
    debug!("Long-poll session {} opened", opened.session.short());

    let (local, remote) = tokio::io::duplex(TRANSPORT_BUFFER);
    tokio::spawn(pump_http(client, session_url, remote));
    Ok(local)
}

fn http_client(ctx: &ClientContext, headers: HeaderMap) -> TunnelResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .danger_accept_invalid_certs(ctx.accept_any_cert);
    if let Some(proxy) = &ctx.proxy {
        let proxy = reqwest::Proxy::all(proxy.as_str()).with_category(ErrorCategory::Configuration)?;
        builder = builder.proxy(proxy);
    }
    builder.build().with_category(ErrorCategory::Configuration)
}

async fn pump_http(client: reqwest::Client, url: Url, remote: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(remote);

    let upstream = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            trace!("poll send {} bytes", n);
            match client.post(url.clone()).body(buf[..n].to_vec()).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    debug!("Long-poll write refused ({})", response.status());
                    return;
                }
                Err(e) => {
                    debug!("Long-poll write failed: {}", e);
                    return;
                }
            }
        }
        if let Err(e) = client.delete(url.clone()).send().await {
            debug!("Long-poll close failed: {}", e);
        }
    };

    let downstream = async {
        loop {
            let response = match client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!("Long-poll read failed: {}", e);
                    break;
                }
            };
            match response.status() {
                StatusCode::OK => {
                    let body = match response.bytes().await {
                        Ok(body) => body,
                        Err(_) => break,
                    };
                    trace!("poll recv {} bytes", body.len());
                    if writer.write_all(&body).await.is_err() {
                        break;
                    }
                }
                StatusCode::NO_CONTENT => continue,
                status => {
                    debug!("Long-poll session ended ({})", status);
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::pin!(upstream);
    tokio::pin!(downstream);
    tokio::select! {
        _ = &mut upstream => {
            let _ = tokio::time::timeout(CLOSE_GRACE, &mut downstream).await;
        }
        _ = &mut downstream => {
            upstream.await;
        }
    }
}

/// URL without the token or credentials, for log lines.
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    format!("{}", shown)
}
