//! Session telemetry.
//!
//! Components never format progress or summaries themselves; they report to
//! a [`SessionObserver`] handed to them at construction. [`LogObserver`]
//! forwards everything to the `log` facade.

use crate::lifecycle::SessionState;
use crate::metadata::MetadataError;
use crate::session::SessionSummary;
use std::sync::Arc;

pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, _from: SessionState, _to: SessionState) {}

    /// Total bytes handed to the audio output so far.
    fn progress(&self, _total_bytes: u64) {}

    /// A metadata record was dropped.
    fn metadata_rejected(&self, _line: &str, _error: &MetadataError) {}

    fn finished(&self, _summary: &SessionSummary) {}
}

/// Default observer writing to the configured logger.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn state_changed(&self, from: SessionState, to: SessionState) {
        log::debug!("Session state: {} -> {}", from, to);
    }

    fn progress(&self, total_bytes: u64) {
        log::debug!("Received: {:.2} MB", total_bytes as f64 / (1024.0 * 1024.0));
    }

    fn metadata_rejected(&self, line: &str, error: &MetadataError) {
        log::warn!("⚠️  Failed to parse metadata: {}", error);
        log::debug!("Raw data: {}", line);
    }

    fn finished(&self, summary: &SessionSummary) {
        log::info!(
            "📊 Total received: {} bytes ({:.2} MB), {}",
            summary.bytes,
            summary.bytes as f64 / (1024.0 * 1024.0),
            summary.reason
        );
    }
}

/// Emits a progress observation every time the running byte count crosses
/// another multiple of `interval`.
pub struct ProgressMeter {
    interval: u64,
    total: u64,
    observer: Arc<dyn SessionObserver>,
}

impl ProgressMeter {
    pub fn new(interval: u64, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            interval: interval.max(1),
            total: 0,
            observer,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        let before = self.total / self.interval;
        self.total += bytes as u64;
        if self.total / self.interval > before {
            self.observer.progress(self.total);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingObserver;

    #[test]
    fn test_progress_fires_once_per_interval() {
        let observer = Arc::new(RecordingObserver::default());
        let mut meter = ProgressMeter::new(100, observer.clone());

        meter.record(60);
        meter.record(60); // crosses 100
        meter.record(30); // 150, same bucket
        meter.record(250); // 400, crosses 200/300/400 in one go
        assert_eq!(meter.total(), 400);
        assert_eq!(observer.progress_events(), vec![120, 400]);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let observer = Arc::new(RecordingObserver::default());
        let mut meter = ProgressMeter::new(0, observer.clone());
        meter.record(1);
        assert_eq!(observer.progress_events(), vec![1]);
    }
}
