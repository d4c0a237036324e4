//! Readiness probing: poll a loopback port until it accepts connections

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How a readiness probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A connection to the port succeeded
    Ready,
    /// The run was stopped before the port opened
    Cancelled,
    /// The port did not open within the timeout
    TimedOut,
}

/// Try to connect to `127.0.0.1:port` every `interval` until it succeeds,
/// `cancel` fires, or `timeout` elapses.
pub async fn wait_for_port(
    port: u16,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            _ = &mut deadline => return ProbeOutcome::TimedOut,
            _ = ticker.tick() => {
                if try_connect(port, interval).await {
                    return ProbeOutcome::Ready;
                }
            }
        }
    }
}

/// One connection attempt; failures are expected while the backend boots
async fn try_connect(port: u16, limit: Duration) -> bool {
    match tokio::time::timeout(limit, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            trace!(port, error = %e, "Port not open yet");
            false
        }
        Err(_) => {
            trace!(port, "Connect attempt timed out");
            false
        }
    }
}
