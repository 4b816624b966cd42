//! Full-duplex byte relay between two stream endpoints.
//!
//! Each direction is an independent copy loop. When one direction reaches
//! end-of-input the opposite write side is shut down (half-close) and the
//! other direction keeps flowing until it ends or stays idle for the drain
//! window. An I/O error on either direction ends the bridge immediately.

use crate::error::TunnelError;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Size of the per-direction copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Default idle window for the remaining direction after the first closes.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long the remaining direction may sit idle after the first
    /// direction has closed. Every relayed chunk restarts the window.
    pub linger: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            linger: DEFAULT_LINGER,
        }
    }
}

impl BridgeConfig {
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

/// One of the two bridged endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Summary of a finished bridge.
#[derive(Debug, Default)]
pub struct BridgeReport {
    /// Bytes copied from A to B.
    pub a_to_b: u64,
    /// Bytes copied from B to A.
    pub b_to_a: u64,
    /// The side whose input ended (or failed) first.
    pub closed_first: Option<Side>,
    /// The first I/O error seen, if any, and the side whose outgoing
    /// direction hit it.
    pub error: Option<io::Error>,
    pub failed_side: Option<Side>,
    /// Whether the second direction went idle past the drain window.
    pub linger_expired: bool,
}

impl BridgeReport {
    /// The bridge failure as a tunnel error, if there was one.
    pub fn failure(&self) -> Option<TunnelError> {
        let e = self.error.as_ref()?;
        let side = match self.failed_side {
            Some(Side::A) => "a",
            Some(Side::B) => "b",
            None => "unknown",
        };
        Some(
            TunnelError::bridge(format!("Bridge failed: {}", e))
                .with_context("side", side)
                .with_context("kind", format!("{:?}", e.kind())),
        )
    }

    fn record(&mut self, side: Side, result: io::Result<u64>) {
        match result {
            Ok(n) => match side {
                Side::A => self.a_to_b = n,
                Side::B => self.b_to_a = n,
            },
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                    self.failed_side = Some(side);
                }
            }
        }
    }
}

/// When the bridge last moved bytes, in either direction.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Copy `reader` into `writer` until end-of-input, then shut `writer` down.
async fn relay<R, W>(mut reader: R, mut writer: W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        activity.touch();
        trace!("Relayed {} bytes ({} total)", n, total);
    }
    writer.shutdown().await?;
    Ok(total)
}

/// Let `remaining` run until it finishes or stays idle for `linger`.
/// `None` means the window expired.
async fn drain<F>(mut remaining: F, linger: Duration, activity: &Activity) -> Option<io::Result<u64>>
where
    F: Future<Output = io::Result<u64>> + Unpin,
{
    activity.touch();
    loop {
        let wait = linger.saturating_sub(activity.idle());
        if wait.is_zero() {
            return None;
        }
        if let Ok(result) = tokio::time::timeout(wait, &mut remaining).await {
            return Some(result);
        }
    }
}

/// Bridge two duplex streams until both directions are done.
pub async fn bind<A, B>(a: A, b: B, config: &BridgeConfig) -> BridgeReport
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    bind_split(a_read, a_write, b_read, b_write, config).await
}

/// Bridge endpoints that are already split into read and write halves,
/// such as standard input and standard output.
pub async fn bind_split<AR, AW, BR, BW>(
    a_read: AR,
    a_write: AW,
    b_read: BR,
    b_write: BW,
    config: &BridgeConfig,
) -> BridgeReport
where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let forward = relay(a_read, b_write, &activity);
    let backward = relay(b_read, a_write, &activity);
    tokio::pin!(forward);
    tokio::pin!(backward);

    let mut report = BridgeReport::default();

    let (first, result) = tokio::select! {
        res = &mut forward => (Side::A, res),
        res = &mut backward => (Side::B, res),
    };
    report.closed_first = Some(first);
    let failed = result.is_err();
    report.record(first, result);

    if failed {
        debug!("Bridge side {:?} failed, closing both ends", first);
        return report;
    }

    debug!("Bridge side {:?} reached end of input, draining", first);
    let drained = match first {
        Side::A => drain(&mut backward, config.linger, &activity).await,
        Side::B => drain(&mut forward, config.linger, &activity).await,
    };
    let second = match first {
        Side::A => Side::B,
        Side::B => Side::A,
    };
    match drained {
        Some(result) => report.record(second, result),
        None => {
            debug!("Bridge idle for {:?} after half-close", config.linger);
            report.linger_expired = true;
        }
    }

    report
}
