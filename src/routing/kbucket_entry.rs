//! Per remote node state kept in a [super::KBucket].
use std::{
    cmp::Ordering,
    net::SocketAddr,
    time::{Duration, SystemTime},
};

use crate::common::{Contact, Id};

/// Timeouts after which an entry is replaced even if it was verified.
pub const MAX_TIMEOUTS: u32 = 5;
/// Timeouts after which an entry not seen for [OLD_AND_STALE_TIME] is replaced.
pub const OLD_AND_STALE_TIMEOUTS: u32 = 2;
pub const OLD_AND_STALE_TIME: Duration = Duration::from_secs(15 * 60);
/// Base of the exponential backoff between pings to a failing entry.
pub const PING_BACKOFF_BASE_INTERVAL: Duration = Duration::from_secs(60);
/// Don't ping entries seen this recently, NAT mappings are still fresh.
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Rtt assumed for entries that never answered a call.
pub const UNKNOWN_RTT: Duration = Duration::from_secs(10);

const RTT_EWMA_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone)]
/// Entry in a [super::KBucket], either in the main list or the replacement ring.
pub struct KBucketEntry {
    pub(crate) id: Id,
    pub(crate) address: SocketAddr,
    pub(crate) version: Option<Vec<u8>>,

    pub(crate) created: SystemTime,
    pub(crate) last_seen: SystemTime,
    pub(crate) last_send: Option<SystemTime>,

    pub(crate) failed_queries: u32,
    pub(crate) verified: bool,
    pub(crate) avg_rtt: Option<Duration>,
}

impl KBucketEntry {
    pub fn new(id: Id, address: SocketAddr) -> Self {
        let now = SystemTime::now();

        KBucketEntry {
            id,
            address,
            version: None,
            created: now,
            last_seen: now,
            last_send: None,
            failed_queries: 0,
            verified: false,
            avg_rtt: None,
        }
    }

    pub fn from_contact(contact: &Contact) -> Self {
        Self::new(contact.id, contact.address)
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.address)
    }

    pub fn version(&self) -> Option<&[u8]> {
        self.version.as_deref()
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    pub fn last_send(&self) -> Option<SystemTime> {
        self.last_send
    }

    pub fn failed_queries(&self) -> u32 {
        self.failed_queries
    }

    /// Whether this entry ever answered one of our calls.
    pub fn verified(&self) -> bool {
        self.verified
    }

    /// Smoothed round trip time, or [UNKNOWN_RTT] if never measured.
    pub fn rtt(&self) -> Duration {
        self.avg_rtt.unwrap_or(UNKNOWN_RTT)
    }

    pub fn never_contacted(&self) -> bool {
        self.last_send.is_none()
    }

    // === Predicates ===

    /// Same id and same socket address.
    pub fn same_contact(&self, other: &KBucketEntry) -> bool {
        self.id == other.id && self.address == other.address
    }

    pub fn match_ip_or_id(&self, other: &KBucketEntry) -> bool {
        self.id == other.id || self.address.ip() == other.address.ip()
    }

    pub fn old_and_stale(&self) -> bool {
        self.failed_queries > OLD_AND_STALE_TIMEOUTS && since(self.last_seen) > OLD_AND_STALE_TIME
    }

    pub fn needs_replacement(&self) -> bool {
        (self.failed_queries > 1 && !self.verified)
            || self.failed_queries > MAX_TIMEOUTS
            || self.old_and_stale()
    }

    /// Dead entries that haven't even contacted us since we last pinged them.
    pub fn removable_without_replacement(&self) -> bool {
        let seen_since_last_ping = match self.last_send {
            Some(last_send) => self.last_seen > last_send,
            None => true,
        };

        self.failed_queries > MAX_TIMEOUTS && !seen_since_last_ping
    }

    /// Good enough to hand out in `nodes` lists.
    pub fn eligible_for_nodes_list(&self) -> bool {
        self.verified && self.failed_queries < 3
    }

    pub fn needs_ping(&self) -> bool {
        if since(self.last_seen) < MIN_PING_INTERVAL || self.within_backoff_window() {
            return false;
        }

        self.failed_queries != 0 || since(self.last_seen) > OLD_AND_STALE_TIME
    }

    fn within_backoff_window(&self) -> bool {
        let shift = self.failed_queries.saturating_sub(1).min(MAX_TIMEOUTS);
        let backoff = PING_BACKOFF_BASE_INTERVAL * (1 << shift);

        match self.last_send {
            Some(last_send) => self.failed_queries != 0 && since(last_send) < backoff,
            None => false,
        }
    }

    // === Mutations ===

    pub fn signal_response(&mut self, rtt: Option<Duration>) {
        self.last_seen = SystemTime::now();
        self.failed_queries = 0;
        self.verified = true;

        if let Some(rtt) = rtt {
            self.update_rtt(rtt);
        }
    }

    pub fn signal_scheduled_request(&mut self) {
        self.last_send = Some(SystemTime::now());
    }

    pub fn signal_request_timeout(&mut self) {
        self.failed_queries = self.failed_queries.saturating_add(1);
    }

    pub fn merge_request_time(&mut self, sent_at: SystemTime) {
        self.last_send = Some(self.last_send.map_or(sent_at, |t| t.max(sent_at)));
    }

    /// Fold what `other` knows about the same contact into this entry.
    pub fn merge_in_timestamps(&mut self, other: &KBucketEntry) {
        if !self.same_contact(other) {
            return;
        }

        self.last_seen = self.last_seen.max(other.last_seen);
        self.last_send = match (self.last_send, other.last_send) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.created = self.created.min(other.created);

        if other.verified {
            self.verified = true;
        }
        if self.avg_rtt.is_none() {
            self.avg_rtt = other.avg_rtt;
        }
        if self.version.is_none() {
            self.version = other.version.clone();
        }
    }

    pub fn set_version(&mut self, version: Option<Vec<u8>>) {
        if version.is_some() {
            self.version = version;
        }
    }

    fn update_rtt(&mut self, rtt: Duration) {
        self.avg_rtt = Some(match self.avg_rtt {
            None => rtt,
            Some(avg) => {
                avg.mul_f64(1.0 - RTT_EWMA_WEIGHT) + rtt.mul_f64(RTT_EWMA_WEIGHT)
            }
        });
    }

    /// Oldest first.
    pub fn age_order(a: &KBucketEntry, b: &KBucketEntry) -> Ordering {
        a.created.cmp(&b.created)
    }
}

impl PartialEq for KBucketEntry {
    fn eq(&self, other: &Self) -> bool {
        self.same_contact(other)
    }
}

impl Eq for KBucketEntry {}

/// Time elapsed since `time`, zero if it lies in the future.
pub(crate) fn since(time: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(time)
        .unwrap_or(Duration::ZERO)
}
