//! Streaming connection lifecycle.
//!
//! Each live connection walks `Connecting -> Authenticating -> Streaming ->
//! Closed`. The subscription registered with the bus unregisters itself on
//! drop, so every exit path - clean close, write error, panic unwind,
//! server shutdown - tears the registration down deterministically.
//!
//! The reconnect schedule lives here too: clients retry with exponential
//! backoff up to a small attempt budget, then fall back to polling the
//! snapshot endpoint. Keeping the schedule next to the server keeps both
//! sides of the contract in one place.

use std::io::Write;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use rand::Rng;
use tracing::{debug, info};

use crate::core::{ItineraryId, SubjectId};
use crate::daemon::broadcast::Subscription;
use crate::daemon::ipc;

/// How often the event pump wakes to check for shutdown while idle.
const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Streaming,
    Closed,
}

/// Why a streaming connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer went away or the write side failed.
    ConnectionLost,
    /// The daemon is shutting down.
    ServerShutdown,
}

/// Writes every published event for one subscription to the connection as
/// an ndjson line until the peer disconnects or the daemon stops.
///
/// The subscription is consumed; dropping it on return unregisters the
/// channel from the bus.
pub fn pump_events<W: Write>(
    subscription: Subscription,
    writer: &mut W,
    shutdown: &Receiver<()>,
) -> CloseReason {
    let itinerary = subscription.itinerary().clone();
    let subject = subscription.subject().clone();
    log_phase(&itinerary, &subject, ConnectionPhase::Streaming);

    let reason = loop {
        // A shutdown message or a dropped sender both mean stop.
        match shutdown.try_recv() {
            Ok(()) | Err(crossbeam::channel::TryRecvError::Disconnected) => {
                break CloseReason::ServerShutdown;
            }
            Err(crossbeam::channel::TryRecvError::Empty) => {}
        }
        match subscription.recv_timeout(IDLE_POLL) {
            Ok(event) => {
                let line = match serde_json::to_string(&event) {
                    Ok(mut line) => {
                        line.push('\n');
                        line
                    }
                    // An unencodable event is a bug upstream; drop it
                    // rather than kill the connection.
                    Err(err) => {
                        debug!(itinerary = %itinerary, error = %err, "event encode failed");
                        continue;
                    }
                };
                if writer.write_all(line.as_bytes()).is_err() || writer.flush().is_err() {
                    break CloseReason::ConnectionLost;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            // Bus dropped the channel; treat as shutdown.
            Err(RecvTimeoutError::Disconnected) => break CloseReason::ServerShutdown,
        }
    };

    log_phase(&itinerary, &subject, ConnectionPhase::Closed);
    info!(
        itinerary = %itinerary,
        subject = %subject,
        reason = ?reason,
        degraded = subscription.is_degraded(),
        "stream closed"
    );
    reason
}

pub fn log_phase(itinerary: &ItineraryId, subject: &SubjectId, phase: ConnectionPhase) {
    debug!(itinerary = %itinerary, subject = %subject, phase = ?phase, "stream phase");
}

/// Deterministic reconnect schedule: `base, 2*base, 4*base, ...` capped at
/// `max`, one entry per attempt. Exhausting the schedule means the client
/// should fall back to polling `get_itinerary`.
pub fn backoff_schedule(base_ms: u64, max_ms: u64, attempts: u32) -> Vec<Duration> {
    let mut delays = Vec::with_capacity(attempts as usize);
    let mut delay = base_ms.max(1);
    for _ in 0..attempts {
        delays.push(Duration::from_millis(delay.min(max_ms)));
        delay = delay.saturating_mul(2);
    }
    delays
}

/// Spread a scheduled delay by up to +/-25% so reconnecting clients do not
/// stampede the daemon in lockstep.
pub fn with_jitter(delay: Duration, rng: &mut impl Rng) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms == 0 {
        return delay;
    }
    let spread = (ms / 4).max(1);
    let offset = rng.gen_range(0..=spread * 2) as i64 - spread as i64;
    Duration::from_millis(ms.saturating_add_signed(offset))
}

/// Reason codes surfaced to streaming clients on a failed connect. An auth
/// failure is distinguishable so the client re-authenticates instead of
/// retrying the same stream.
pub fn connect_error_code(auth_failed: bool) -> &'static str {
    if auth_failed {
        ipc::codes::AUTH_REJECTED
    } else {
        ipc::codes::OVERLOADED
    }
}
