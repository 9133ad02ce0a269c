//! Frame counters and timing for the overlay session.
//!
//! Counters are atomics behind `Arc` so a clone handed to `main` observes the
//! same values the orchestrator updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

/// Times one loop iteration.
#[derive(Debug)]
pub struct FrameTimer {
    start_time: Instant,
}

impl FrameTimer {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Returns elapsed time since construction in microseconds.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }
}

/// True when `count` events call for a periodic summary every `interval`.
/// An interval of zero disables summaries.
pub fn summary_due(count: u64, interval: u64) -> bool {
    interval > 0 && count > 0 && count % interval == 0
}

/// Aggregated counters for one overlay session.
#[derive(Clone, Debug, Default)]
pub struct FrameMetrics {
    frames_presented: Arc<AtomicU64>,
    frames_skipped: Arc<AtomicU64>,
    surface_rebuilds: Arc<AtomicU64>,
    epoch_rebuilds: Arc<AtomicU64>,
    gpu_stalls: Arc<AtomicU64>,
    total_frame_time_us: Arc<AtomicU64>,
}

impl FrameMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a presented frame and how long its iteration took.
    pub fn record_presented(&self, timer: &FrameTimer) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
        self.total_frame_time_us
            .fetch_add(timer.elapsed_us(), Ordering::Relaxed);
    }

    /// Records an iteration that ended without a submission and returns the
    /// new skip count.
    pub fn record_skipped(&self) -> u64 {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_surface_rebuild(&self) {
        self.surface_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_epoch_rebuild(&self) {
        self.epoch_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// A fence or acquire wait ran into its timeout.
    pub fn record_stall(&self) {
        self.gpu_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn surface_rebuilds(&self) -> u64 {
        self.surface_rebuilds.load(Ordering::Relaxed)
    }

    pub fn epoch_rebuilds(&self) -> u64 {
        self.epoch_rebuilds.load(Ordering::Relaxed)
    }

    pub fn gpu_stalls(&self) -> u64 {
        self.gpu_stalls.load(Ordering::Relaxed)
    }

    /// Average iteration time (ms) over presented frames.
    pub fn avg_frame_time_ms(&self) -> f32 {
        let total = self.frames_presented();
        if total == 0 {
            return 0.0;
        }
        let total_time = self.total_frame_time_us.load(Ordering::Relaxed);
        total_time as f32 / total as f32 / 1000.0
    }

    pub fn log_summary(&self, label: &str) {
        info!(
            "[Metrics] {}: {} presented, {} skipped, {} surface rebuilds, {} epochs, {} stalls, {:.2} ms/frame",
            label,
            self.frames_presented(),
            self.frames_skipped(),
            self.surface_rebuilds(),
            self.epoch_rebuilds(),
            self.gpu_stalls(),
            self.avg_frame_time_ms()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn frame_timer_tracks_elapsed_time() {
        let timer = FrameTimer::start();
        thread::sleep(Duration::from_millis(2));
        assert!(timer.elapsed_us() >= 2_000);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = FrameMetrics::new();
        let observer = metrics.clone();
        metrics.record_skipped();
        metrics.record_stall();
        metrics.record_surface_rebuild();
        metrics.record_epoch_rebuild();

        assert_eq!(observer.frames_skipped(), 1);
        assert_eq!(observer.gpu_stalls(), 1);
        assert_eq!(observer.surface_rebuilds(), 1);
        assert_eq!(observer.epoch_rebuilds(), 1);
        assert_eq!(observer.avg_frame_time_ms(), 0.0);
    }

    #[test]
    fn average_covers_presented_frames_only() {
        let metrics = FrameMetrics::new();
        let timer = FrameTimer::start();
        thread::sleep(Duration::from_millis(2));
        metrics.record_presented(&timer);
        metrics.record_skipped();

        assert_eq!(metrics.frames_presented(), 1);
        assert!(metrics.avg_frame_time_ms() >= 2.0);
    }

    #[test]
    fn summaries_fall_on_interval_multiples() {
        assert!(!summary_due(0, 300));
        assert!(!summary_due(299, 300));
        assert!(summary_due(300, 300));
        assert!(summary_due(600, 300));
        assert!(!summary_due(300, 0));

        let metrics = FrameMetrics::new();
        let due: Vec<u64> = (0..7)
            .map(|_| metrics.record_skipped())
            .filter(|&skipped| summary_due(skipped, 3))
            .collect();
        assert_eq!(due, vec![3, 6]);
    }
}
