//! Client configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use wst_core::auth::DEFAULT_IDENTITY_HEADER;
use wst_core::TunnelSpec;

/// An operator-supplied header, `Name: value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraHeader {
    pub name: String,
    pub value: String,
}

impl std::str::FromStr for ExtraHeader {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once(':')
            .ok_or_else(|| format!("Expected NAME:VALUE, got: {}", s))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("Empty header name in: {}", s));
        }
        Ok(ExtraHeader {
            name: name.to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// wst client - tunnel a local TCP port (or stdio) through a WebSocket server.
#[derive(Parser, Debug, Clone)]
#[command(name = "wst-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Tunnel server URL (ws://, wss://, http:// or https://)
    #[arg(env = "WST_SERVER")]
    pub server: String,

    /// What to tunnel: PORT, HOST:PORT, [HOST:]PORT:RHOST:RPORT or stdio:RHOST:RPORT
    #[arg(short, long, env = "WST_TUNNEL", value_parser = parse_tunnel_spec)]
    pub tunnel: TunnelSpec,

    /// Shared authentication key used to sign the destination
    #[arg(short = 'k', long = "authkey", env = "WST_AUTHKEY")]
    pub auth_key: Option<String>,

    /// Use the HTTP long-poll transport instead of WebSocket
    #[arg(long = "http", env = "WST_HTTP_ONLY")]
    pub http_only: bool,

    /// Additional request header, NAME:VALUE (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<ExtraHeader>,

    /// Accept any server certificate (self-signed, expired or for another host)
    #[arg(short = 'c', long = "anycert", env = "WST_ANYCERT")]
    pub any_cert: bool,

    /// Reach the server through an HTTP proxy, http://[USER:PASS@]HOST:PORT
    #[arg(short = 'p', long, env = "WST_PROXY", value_parser = parse_proxy)]
    pub proxy: Option<Url>,

    /// Name of the header carrying this client's identity
    #[arg(long = "idheader", env = "WST_ID_HEADER", default_value = DEFAULT_IDENTITY_HEADER)]
    pub identity_header: String,

    /// Transport handshake timeout in seconds (0 = wait indefinitely)
    #[arg(long, env = "WST_CONNECT_TIMEOUT", default_value = "30")]
    pub connect_timeout: u64,

    /// Seconds the remaining direction may drain after one side closes
    #[arg(long, env = "WST_LINGER", default_value = "5")]
    pub linger: u64,

    /// Directory to chroot into after startup (requires --chuser and root)
    #[arg(long)]
    pub chroot: Option<PathBuf>,

    /// User to switch to after chroot
    #[arg(long)]
    pub chuser: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "WST_DEBUG")]
    pub debug: bool,
}

fn parse_tunnel_spec(s: &str) -> Result<TunnelSpec, String> {
    s.parse().map_err(|e| format!("{}", e))
}

fn parse_header(s: &str) -> Result<ExtraHeader, String> {
    s.parse()
}

fn parse_proxy(s: &str) -> Result<Url, String> {
    let url = Url::parse(s).map_err(|e| format!("Invalid proxy URL {}: {}", s, e))?;
    if url.scheme() != "http" {
        return Err(format!("Only http:// proxies are supported, got: {}", s));
    }
    if url.host_str().is_none() {
        return Err(format!("Proxy URL has no host: {}", s));
    }
    Ok(url)
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger)
    }

    /// Headers sent with every transport attempt, excluding the identity.
    pub fn extra_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect()
    }
}
