use super::code::SessionCode;
use super::signaling::SignalingRelay;
use crate::session::{RidePhase, RideSnapshot};
use crate::telemetry::MetricsRecorder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodically mirrors the latest ride snapshot to viewers of a display code.
///
/// Pushes happen on a fixed interval regardless of how often the snapshot
/// changes. Every push is fire-and-forget: a failure is logged and counted and
/// the next interval tries again.
pub struct StateBroadcaster;

impl StateBroadcaster {
    pub fn spawn(
        relay: Arc<dyn SignalingRelay>,
        code: SessionCode,
        snapshots: watch::Receiver<RideSnapshot>,
        interval: Duration,
        metrics: Arc<MetricsRecorder>,
    ) -> BroadcastHandle {
        let task = tokio::spawn(broadcast_loop(relay, code.clone(), snapshots, interval, metrics));
        BroadcastHandle { code, task }
    }
}

async fn broadcast_loop(
    relay: Arc<dyn SignalingRelay>,
    code: SessionCode,
    snapshots: watch::Receiver<RideSnapshot>,
    interval: Duration,
    metrics: Arc<MetricsRecorder>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let snapshot = snapshots.borrow().clone();
        match tokio::time::timeout(interval, relay.push_state(&code, &snapshot)).await {
            Ok(Ok(())) => metrics.record_broadcast(true),
            Ok(Err(err)) => {
                log::warn!("state broadcast to {} failed: {}", code, err);
                metrics.record_broadcast(false);
            }
            Err(_) => {
                log::warn!("state broadcast to {} timed out", code);
                metrics.record_broadcast(false);
            }
        }
        if snapshot.phase == RidePhase::Finished {
            log::info!("ride finished, state broadcast to {} stopped", code);
            break;
        }
        if snapshots.has_changed().is_err() {
            log::debug!("ride session gone, state broadcast to {} stopped", code);
            break;
        }
    }
}

pub struct BroadcastHandle {
    code: SessionCode,
    task: JoinHandle<()>,
}

impl BroadcastHandle {
    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops pushing; used when the display code is cleared.
    pub fn stop(self) {}
}

impl Drop for BroadcastHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
