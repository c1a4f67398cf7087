use crate::downloads::DownloadId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::time::Instant;

/// Reported by [`SpeedTracker::speed`] before the first rate sample exists,
/// so observers can tell "unknown" apart from a stalled transfer.
pub const NO_SAMPLES: f64 = -1.0;

/// Per-download transfer rate, averaged over a rolling window of samples.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    samples: VecDeque<f64>,
    window: usize,
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedTracker {
    pub fn new(starting_bytes: u64, window: usize) -> Self {
        Self::starting_at(starting_bytes, window, Instant::now())
    }

    pub fn starting_at(starting_bytes: u64, window: usize, now: Instant) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window + 1),
            window,
            last_bytes: starting_bytes,
            last_time: now,
        }
    }

    pub fn push_size(&mut self, bytes: u64) {
        self.push_size_at(bytes, Instant::now());
    }

    pub fn push_size_at(&mut self, bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_time).as_secs_f64();

        // Two pushes in the same instant carry no rate information.
        if elapsed > 0.0 {
            let rate = (bytes as f64 - self.last_bytes as f64) / elapsed;
            self.samples.push_back(rate);
            while self.samples.len() > self.window {
                self.samples.pop_front();
            }
        }

        self.last_bytes = bytes;
        self.last_time = now;
    }

    /// Mean of the retained samples in bytes per second, or [`NO_SAMPLES`].
    pub fn speed(&self) -> f64 {
        if self.samples.is_empty() {
            return NO_SAMPLES;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    #[cfg(test)]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Download id to current speed estimate, as sent to observers.
pub type SpeedMap = BTreeMap<DownloadId, f64>;

pub fn serialize_speeds(trackers: &HashMap<DownloadId, SpeedTracker>) -> SpeedMap {
    trackers
        .iter()
        .map(|(id, tracker)| (id.clone(), tracker.speed()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_sentinel_before_first_sample() {
        let tracker = SpeedTracker::new(0, 20);
        assert_eq!(tracker.speed(), NO_SAMPLES);
        assert_eq!(tracker.sample_count(), 0);
    }

    #[test]
    fn speed_is_mean_of_step_rates() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::starting_at(0, 20, start);

        // 1000 B over 1s, then 1000 B over 0.5s
        tracker.push_size_at(1000, start + Duration::from_secs(1));
        tracker.push_size_at(2000, start + Duration::from_millis(1500));

        assert_eq!(tracker.sample_count(), 2);
        assert!((tracker.speed() - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn window_evicts_oldest_sample() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::starting_at(0, 3, start);

        let mut bytes = 0;
        for (step, rate) in [100u64, 200, 300, 400, 500].into_iter().enumerate() {
            bytes += rate;
            tracker.push_size_at(bytes, start + Duration::from_secs(step as u64 + 1));
            assert!(tracker.sample_count() <= 3);
        }

        assert_eq!(tracker.sample_count(), 3);
        assert!((tracker.speed() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_time_is_skipped() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::starting_at(0, 20, start);

        tracker.push_size_at(500, start);
        assert_eq!(tracker.speed(), NO_SAMPLES);

        // The skipped push still moves the reference point.
        tracker.push_size_at(1500, start + Duration::from_secs(2));
        assert!((tracker.speed() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn stalled_transfer_reports_zero_not_sentinel() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::starting_at(700, 20, start);
        tracker.push_size_at(700, start + Duration::from_millis(500));
        assert_eq!(tracker.speed(), 0.0);
    }

    #[test]
    fn serializes_every_tracker() {
        let start = Instant::now();
        let mut trackers = HashMap::new();
        let mut fast = SpeedTracker::starting_at(0, 20, start);
        fast.push_size_at(4000, start + Duration::from_secs(2));
        trackers.insert("a".to_string(), fast);
        trackers.insert("b".to_string(), SpeedTracker::starting_at(0, 20, start));

        let speeds = serialize_speeds(&trackers);
        assert_eq!(speeds.len(), 2);
        assert_eq!(speeds["a"], 2000.0);
        assert_eq!(speeds["b"], NO_SAMPLES);
    }
}
