// Transfer progress: cumulative bytes, 1-second window throughput, ETA and percentage.

use std::time::Duration;
use tokio::time::Instant;

const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Point-in-time view of a [`ProgressTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressReport {
    pub downloaded_bytes: u64,
    pub total_bytes_estimate: u64,
    pub downloaded_segments: usize,
    pub total_segments: usize,
    /// Bytes per second over the last completed sample window.
    pub speed: f64,
    pub eta: Option<Duration>,
    /// Always within `[0, 100]`, never decreasing.
    pub percent: f64,
}

#[derive(Debug)]
pub struct ProgressTracker {
    total_segments: usize,
    downloaded_segments: usize,
    downloaded_bytes: u64,
    total_bytes_estimate: u64,
    /// `None` while paused.
    window_start: Option<Instant>,
    window_bytes: u64,
    speed: f64,
    eta: Option<Duration>,
    reported_percent: f64,
}

impl ProgressTracker {
    pub fn new(total_segments: usize) -> Self {
        Self {
            total_segments,
            downloaded_segments: 0,
            downloaded_bytes: 0,
            total_bytes_estimate: 0,
            window_start: Some(Instant::now()),
            window_bytes: 0,
            speed: 0.0,
            eta: None,
            reported_percent: 0.0,
        }
    }

    /// Account for one successfully acquired segment of `bytes` length.
    pub fn record_segment(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
        self.downloaded_segments += 1;
        self.refine_estimate();

        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.window_bytes += bytes;

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= SAMPLE_WINDOW {
            self.speed = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.window_start = Some(now);
            self.window_bytes = 0;
            self.eta = if self.speed > 0.0 && self.total_bytes_estimate > 0 {
                let remaining = self.total_bytes_estimate.saturating_sub(self.downloaded_bytes);
                Some(Duration::from_secs_f64(remaining as f64 / self.speed))
            } else {
                None
            };
        }
    }

    /// The estimate starts as first-segment size times segment count and is
    /// refined with the running average after every segment.
    fn refine_estimate(&mut self) {
        if self.downloaded_segments == 0 {
            return;
        }
        let average = self.downloaded_bytes / self.downloaded_segments as u64;
        self.total_bytes_estimate = average.saturating_mul(self.total_segments as u64);
    }

    /// Freeze the throughput window. Paused time never counts toward speed.
    pub fn pause(&mut self) {
        self.window_start = None;
        self.window_bytes = 0;
    }

    /// Start a fresh throughput window.
    pub fn resume(&mut self) {
        if self.window_start.is_none() {
            self.window_start = Some(Instant::now());
        }
    }

    pub fn is_paused(&self) -> bool {
        self.window_start.is_none()
    }

    fn raw_percent(&self) -> f64 {
        let percent = if self.total_bytes_estimate > 0 {
            self.downloaded_bytes as f64 / self.total_bytes_estimate as f64 * 100.0
        } else if self.total_segments > 0 {
            self.downloaded_segments as f64 / self.total_segments as f64 * 100.0
        } else {
            0.0
        };
        percent.clamp(0.0, 100.0)
    }

    pub fn report(&mut self) -> ProgressReport {
        self.reported_percent = self.reported_percent.max(self.raw_percent());
        ProgressReport {
            downloaded_bytes: self.downloaded_bytes,
            total_bytes_estimate: self.total_bytes_estimate,
            downloaded_segments: self.downloaded_segments,
            total_segments: self.total_segments,
            speed: self.speed,
            eta: self.eta,
            percent: self.reported_percent,
        }
    }

    /// Final report for a completed transfer: 100% and no remaining time.
    pub fn complete(&mut self) -> ProgressReport {
        self.reported_percent = 100.0;
        self.eta = Some(Duration::ZERO);
        self.total_bytes_estimate = self.downloaded_bytes;
        self.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn speed_sampled_once_per_second() {
        let mut tracker = ProgressTracker::new(10);
        tracker.record_segment(1000);
        // Under a second: no sample yet.
        assert_eq!(tracker.report().speed, 0.0);

        tokio::time::advance(Duration::from_millis(1000)).await;
        tracker.record_segment(1000);
        let report = tracker.report();
        assert_eq!(report.speed, 2000.0);
        assert_eq!(report.total_bytes_estimate, 10_000);
        assert_eq!(report.eta, Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_excluded_from_speed() {
        let mut tracker = ProgressTracker::new(4);
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.record_segment(500);
        assert_eq!(tracker.report().speed, 500.0);

        tracker.pause();
        assert!(tracker.is_paused());
        tokio::time::advance(Duration::from_secs(60)).await;
        tracker.resume();

        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.record_segment(1000);
        // 1000 bytes over the 2 active seconds, not over 62.
        assert_eq!(tracker.report().speed, 500.0);
    }

    #[test]
    fn percentage_uses_segment_fallback_without_estimate() {
        let mut tracker = ProgressTracker::new(4);
        tracker.record_segment(0);
        let report = tracker.report();
        assert_eq!(report.total_bytes_estimate, 0);
        assert_eq!(report.percent, 25.0);
    }

    #[test]
    fn percentage_is_monotonic_and_clamped() {
        let mut tracker = ProgressTracker::new(3);
        let mut last = 0.0;
        // A large first segment followed by small ones shrinks the estimate.
        for bytes in [5000, 10, 10] {
            tracker.record_segment(bytes);
            let p = tracker.report().percent;
            assert!((0.0..=100.0).contains(&p));
            assert!(p >= last);
            last = p;
        }
        assert_eq!(tracker.complete().percent, 100.0);
    }

    #[test]
    fn three_one_kilobyte_segments() {
        let mut tracker = ProgressTracker::new(3);
        for _ in 0..3 {
            tracker.record_segment(1024);
        }
        let report = tracker.complete();
        assert_eq!(report.downloaded_bytes, 3072);
        assert_eq!(report.downloaded_segments, 3);
        assert_eq!(report.total_segments, 3);
        assert_eq!(report.percent, 100.0);
    }
}
