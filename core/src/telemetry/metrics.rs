use serde::Serialize;
use std::sync::Mutex;

/// Counters shared between the frame loop and the broadcast task.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_analyzed: usize,
    pub frames_skipped: usize,
    pub pedal_events: usize,
    pub stalls_discarded: usize,
    pub broadcasts_sent: usize,
    pub broadcast_failures: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut metrics) = self.inner.lock() {
            apply(&mut metrics);
        }
    }

    pub fn record_frame(&self, analyzed: bool) {
        self.update(|m| {
            if analyzed {
                m.frames_analyzed += 1;
            } else {
                m.frames_skipped += 1;
            }
        });
    }

    pub fn record_pedal_events(&self, count: usize) {
        self.update(|m| m.pedal_events += count);
    }

    pub fn record_stall(&self) {
        self.update(|m| m.stalls_discarded += 1);
    }

    pub fn record_broadcast(&self, delivered: bool) {
        self.update(|m| {
            if delivered {
                m.broadcasts_sent += 1;
            } else {
                m.broadcast_failures += 1;
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|m| *m).unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = MetricsRecorder::new();
        metrics.record_frame(true);
        metrics.record_frame(false);
        metrics.record_pedal_events(3);
        metrics.record_broadcast(false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_analyzed, 1);
        assert_eq!(snapshot.frames_skipped, 1);
        assert_eq!(snapshot.pedal_events, 3);
        assert_eq!(snapshot.broadcast_failures, 1);
        assert_eq!(snapshot.broadcasts_sent, 0);
    }
}
