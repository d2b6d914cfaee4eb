//! Adaptive stall timeout from the observed round trip times.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

const BIN_SIZE: Duration = Duration::from_millis(50);
/// Samples needed before the histogram is trusted.
const MIN_SAMPLES: u64 = 16;
const PERCENTILE: f64 = 0.9;
/// Applied to the histogram on every update, old samples fade out.
const DECAY_FACTOR: f64 = 0.98;

#[derive(Debug)]
/// Decaying histogram of round trip times in 50ms bins.
///
/// The stall timeout is the upper edge of the bin holding the 90th
/// percentile, clamped to `[baseline_min, timeout_max]`.
pub struct ResponseTimeoutFilter {
    bins: Mutex<Vec<f64>>,
    samples: AtomicU64,
    /// Current stall timeout in milliseconds.
    timeout: AtomicU64,
    baseline_min: Duration,
    timeout_max: Duration,
}

impl ResponseTimeoutFilter {
    pub fn new(baseline_min: Duration, timeout_max: Duration) -> Self {
        let num_bins = (timeout_max.as_millis() / BIN_SIZE.as_millis()).max(1) as usize;

        ResponseTimeoutFilter {
            bins: Mutex::new(vec![0.0; num_bins]),
            samples: AtomicU64::new(0),
            timeout: AtomicU64::new(timeout_max.as_millis() as u64),
            baseline_min: baseline_min.min(timeout_max),
            timeout_max,
        }
    }

    pub fn update(&self, rtt: Duration) {
        let mut bins = self.bins.lock().unwrap_or_else(PoisonError::into_inner);

        let index = ((rtt.as_millis() / BIN_SIZE.as_millis()) as usize).min(bins.len() - 1);

        for bin in bins.iter_mut() {
            *bin *= DECAY_FACTOR;
        }
        bins[index] += 1.0;

        let samples = self.samples.fetch_add(1, Ordering::AcqRel) + 1;
        if samples < MIN_SAMPLES {
            return;
        }

        let total: f64 = bins.iter().sum();
        let mut cumulative = 0.0;
        let mut percentile_bin = bins.len() - 1;

        for (i, bin) in bins.iter().enumerate() {
            cumulative += bin;
            if cumulative >= total * PERCENTILE {
                percentile_bin = i;
                break;
            }
        }

        let timeout = (BIN_SIZE * (percentile_bin as u32 + 1)).clamp(self.baseline_min, self.timeout_max);

        self.timeout
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Time after which a call without a response is considered stalled.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.load(Ordering::Acquire))
    }

    pub fn timeout_max(&self) -> Duration {
        self.timeout_max
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filter() -> ResponseTimeoutFilter {
        ResponseTimeoutFilter::new(Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn max_until_warmed_up() {
        let filter = filter();

        for _ in 0..MIN_SAMPLES - 1 {
            filter.update(Duration::from_millis(20));
        }
        assert_eq!(filter.stall_timeout(), Duration::from_secs(10));

        filter.update(Duration::from_millis(20));
        assert_eq!(filter.stall_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn follows_the_percentile() {
        let filter = filter();

        for i in 0..100 {
            let rtt = if i % 10 == 0 { 2000 } else { 300 };
            filter.update(Duration::from_millis(rtt));
        }

        let timeout = filter.stall_timeout();
        assert!(timeout >= Duration::from_millis(350), "{timeout:?}");
        assert!(timeout <= Duration::from_millis(2050), "{timeout:?}");
    }

    #[test]
    fn clamped_to_max() {
        let filter = filter();

        for _ in 0..50 {
            filter.update(Duration::from_secs(60));
        }

        assert_eq!(filter.stall_timeout(), Duration::from_secs(10));
    }
}
