use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Run-wide counters shared by the sequential and streaming pipelines.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

/// Point-in-time copy of the run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_processed: usize,
    pub frames_skipped: usize,
    pub frames_dropped: usize,
    pub detections: usize,
    pub fallback_cells: usize,
    pub overflow_events: usize,
    pub dropped_hits: usize,
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

    pub fn record_processed(&self, detections: usize, fallback_cells: usize, dropped_hits: usize) {
        self.update(|m| {
            m.frames_processed += 1;
            m.detections += detections;
            m.fallback_cells += fallback_cells;
            if dropped_hits > 0 {
                m.overflow_events += 1;
                m.dropped_hits += dropped_hits;
            }
        });
    }

    pub fn record_skipped(&self) {
        self.update(|m| m.frames_skipped += 1);
    }

    pub fn record_dropped(&self) {
        self.update(|m| m.frames_dropped += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
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
    fn counters_accumulate() {
        let metrics = MetricsRecorder::new();
        metrics.record_processed(3, 2, 0);
        metrics.record_processed(1, 0, 5);
        metrics.record_skipped();
        metrics.record_dropped();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_processed, 2);
        assert_eq!(snapshot.detections, 4);
        assert_eq!(snapshot.fallback_cells, 2);
        assert_eq!(snapshot.overflow_events, 1);
        assert_eq!(snapshot.dropped_hits, 5);
        assert_eq!(snapshot.frames_skipped, 1);
        assert_eq!(snapshot.frames_dropped, 1);
    }
}
