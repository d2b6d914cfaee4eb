//! Per ip hit counters with a token bucket style decay.
use std::{
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

pub const DEFAULT_BURST: u32 = 10;
pub const DEFAULT_PER_SECOND: u32 = 2;

#[derive(Debug)]
/// Counts hits per ip, forgetting `per_second` of them every second.
pub struct SpamThrottle {
    counters: DashMap<IpAddr, u32>,
    burst: u32,
    per_second: u32,
    started: Instant,
    /// Whole seconds since `started` already accounted for by [Self::decay].
    decayed_until: AtomicU64,
}

impl SpamThrottle {
    pub fn new(burst: u32, per_second: u32) -> Self {
        SpamThrottle {
            counters: DashMap::new(),
            burst,
            per_second,
            started: Instant::now(),
            decayed_until: AtomicU64::new(0),
        }
    }

    /// Record a hit, returns true if `ip` is now over the burst.
    pub fn add_and_test(&self, ip: IpAddr) -> bool {
        self.add(ip) > self.burst
    }

    /// Whether `ip` is over the burst, without recording a hit.
    pub fn test(&self, ip: IpAddr) -> bool {
        self.counters.get(&ip).is_some_and(|c| *c > self.burst)
    }

    /// Record a hit and return how long to wait before acting on it.
    pub fn calculate_delay_and_add(&self, ip: IpAddr) -> Duration {
        let count = self.add(ip);
        let excess = count.saturating_sub(self.burst) as u64;

        Duration::from_millis(excess * 1000 / self.per_second.max(1) as u64)
    }

    /// Undo one hit.
    pub fn saturating_dec(&self, ip: IpAddr) {
        self.counters.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    fn add(&self, ip: IpAddr) -> u32 {
        let mut count = self.counters.entry(ip).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget the hits that expired since the last decay.
    ///
    /// Cheap to call often, only the caller that advances the clock by at
    /// least a second does any work.
    pub fn decay(&self) {
        let now = self.started.elapsed().as_secs();
        let last = self.decayed_until.load(Ordering::Acquire);

        if now <= last {
            return;
        }

        if self
            .decayed_until
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let delta = ((now - last) * self.per_second as u64).min(u32::MAX as u64) as u32;

        self.counters.retain(|_, count| {
            *count = count.saturating_sub(delta);
            *count > 0
        });
    }

    #[cfg(test)]
    pub(crate) fn clear(&self) {
        self.counters.clear();
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for SpamThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_BURST, DEFAULT_PER_SECOND)
    }
}
