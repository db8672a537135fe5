//! Liveness sweep
//!
//! TCP resets are not always visible to the application, so every tick
//! probes every registered connection with a WebSocket ping. A connection
//! that has not answered the previous tick's probe with a pong by the
//! next tick is terminated and evicted. Other inbound traffic does not
//! count as an answer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::SessionRegistry;
use crate::server::ShutdownSignal;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
}

/// Run one heartbeat tick over the whole registry
///
/// Never stops early: every connection is either probed or evicted.
pub fn sweep(registry: &SessionRegistry) -> SweepReport {
    let mut report = SweepReport::default();

    for conn in registry.snapshot() {
        if !conn.mark_unconfirmed() {
            info!(user = %conn.user(), conn_id = %conn.id(), "Cleaning up dead connection");
            registry.remove_connection(conn.user(), conn.id());
            conn.terminate();
            report.evicted += 1;
            continue;
        }

        if let Err(e) = conn.ping() {
            debug!(user = %conn.user(), error = %e, "Liveness probe not queued");
        }
        report.probed += 1;
    }

    report
}

/// Sweep `registry` every `period` until shutdown
pub async fn run(registry: Arc<SessionRegistry>, period: Duration, mut shutdown: ShutdownSignal) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let report = sweep(&registry);
                debug!(probed = report.probed, evicted = report.evicted, "Heartbeat sweep");
            }
        }
    }
    debug!("Heartbeat stopped");
}
