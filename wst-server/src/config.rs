//! Server configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use wst_core::address::parse_listen_addr;
use wst_core::auth::DEFAULT_IDENTITY_HEADER;
use wst_core::{AuthContext, Endpoint};

/// wst server - accept WebSocket and HTTP long-poll tunnels and relay them to TCP.
#[derive(Parser, Debug, Clone)]
#[command(name = "wst-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to listen on, [HOST:]PORT
    #[arg(short, long, env = "WST_LISTEN", value_parser = parse_endpoint_or_port)]
    pub server: Endpoint,

    /// Lock every tunnel to this destination, HOST:PORT
    #[arg(short, long, env = "WST_TUNNEL", value_parser = parse_endpoint)]
    pub tunnel: Option<Endpoint>,

    /// Shared key clients must sign their destination with
    #[arg(short = 'k', long = "authkey", env = "WST_AUTHKEY")]
    pub auth_key: Option<String>,

    /// Name of the header carrying the client identity
    #[arg(long = "idheader", env = "WST_ID_HEADER", default_value = DEFAULT_IDENTITY_HEADER)]
    pub identity_header: String,

    /// Destination connect timeout in seconds (0 = wait indefinitely)
    #[arg(long, env = "WST_CONNECT_TIMEOUT", default_value = "30")]
    pub connect_timeout: u64,

    /// How long a long-poll read waits for data, in seconds
    #[arg(long, env = "WST_POLL_WAIT", default_value = "25")]
    pub poll_wait: u64,

    /// Long-poll sessions without requests for this many seconds are closed
    #[arg(long, env = "WST_POLL_IDLE_TIMEOUT", default_value = "60")]
    pub poll_idle_timeout: u64,

    /// Seconds the remaining direction may drain after one side closes
    #[arg(long, env = "WST_LINGER", default_value = "5")]
    pub linger: u64,

    /// Directory to chroot into once listening (requires --chuser and root)
    #[arg(long)]
    pub chroot: Option<PathBuf>,

    /// User to switch to after chroot
    #[arg(long)]
    pub chuser: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "WST_DEBUG")]
    pub debug: bool,
}

fn parse_endpoint_or_port(s: &str) -> Result<Endpoint, String> {
    parse_listen_addr(s).map_err(|e| e.to_string())
}

fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    s.parse().map_err(|e| format!("{}", e))
}

impl ServerConfig {
    /// Settings for a server on `listen` with everything else defaulted.
    pub fn new(listen: Endpoint) -> Self {
        Self {
            server: listen,
            tunnel: None,
            auth_key: None,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            connect_timeout: 30,
            poll_wait: 25,
            poll_idle_timeout: 60,
            linger: 5,
            chroot: None,
            chuser: None,
            debug: false,
        }
    }

    pub fn auth_context(&self) -> AuthContext {
        AuthContext::new(self.auth_key.clone(), self.identity_header.clone())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait)
    }

    pub fn poll_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_idle_timeout)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger)
    }
}
