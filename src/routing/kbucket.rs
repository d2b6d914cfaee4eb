//! Bounded list of known nodes plus a ring of replacement candidates.
use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::kbucket_entry::KBucketEntry;
use crate::common::{Id, MAX_BUCKET_SIZE_K};

/// Capacity of the replacement ring, a power of two.
pub const REPLACEMENT_BUCKET_SIZE: usize = 8;
/// Buckets are refreshed when none of their entries was touched for this long.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

const VERIFIED_LINGER_TIME: Duration = Duration::from_secs(5 * 60);
const LINGER_TIME: Duration = Duration::from_secs(1);

/// A k-bucket: at most [MAX_BUCKET_SIZE_K] verified entries, oldest first,
/// and a fixed ring of replacement candidates.
///
/// Readers get a cheap snapshot of the main list through [KBucket::entries],
/// every mutation installs a new list.
#[derive(Debug)]
pub struct KBucket {
    inner: Mutex<Inner>,
    last_refresh: Mutex<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Arc<Vec<KBucketEntry>>,
    replacements: ReplacementRing,
}

#[derive(Debug, Default)]
struct ReplacementRing {
    slots: [Option<KBucketEntry>; REPLACEMENT_BUCKET_SIZE],
    pointer: usize,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            inner: Mutex::new(Inner::default()),
            last_refresh: Mutex::new(Instant::now()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Getters ===

    /// Snapshot of the main list, oldest first.
    pub fn entries(&self) -> Arc<Vec<KBucketEntry>> {
        self.lock().entries.clone()
    }

    pub fn replacement_entries(&self) -> Vec<KBucketEntry> {
        self.lock().replacements.slots.iter().flatten().cloned().collect()
    }

    pub fn num_entries(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn num_replacements(&self) -> usize {
        self.lock().replacements.slots.iter().flatten().count()
    }

    pub fn is_full(&self) -> bool {
        self.num_entries() >= MAX_BUCKET_SIZE_K
    }

    pub fn find_by_ip_or_id(&self, ip: IpAddr, id: &Id) -> Option<KBucketEntry> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.id == *id || e.address.ip() == ip)
            .cloned()
    }

    pub fn find_by_address(&self, address: SocketAddr) -> Option<KBucketEntry> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.address == address)
            .cloned()
    }

    /// A replacement candidate we never sent anything to.
    pub fn find_pingable_replacement(&self) -> Option<KBucketEntry> {
        self.lock()
            .replacements
            .slots
            .iter()
            .flatten()
            .find(|e| e.never_contacted())
            .cloned()
    }

    pub fn needs_to_be_refreshed(&self) -> bool {
        let last_refresh = *self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        last_refresh.elapsed() > BUCKET_REFRESH_INTERVAL
            && self.lock().entries.iter().any(|e| e.needs_ping())
    }

    pub fn update_refresh_timer(&self) {
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    // === Public Methods ===

    pub fn insert_or_refresh(&self, new_entry: KBucketEntry) {
        let mut inner = self.lock();

        if let Some(index) = inner.entries.iter().position(|e| e.same_contact(&new_entry)) {
            Arc::make_mut(&mut inner.entries)[index].merge_in_timestamps(&new_entry);
            return;
        }

        if let Some(existing) = inner.entries.iter().find(|e| e.match_ip_or_id(&new_entry)) {
            debug!(
                context = "kbucket_insert",
                existing_id = %existing.id,
                existing_address = ?existing.address,
                new_id = %new_entry.id,
                new_address = ?new_entry.address,
                "Rejecting entry sharing only ip or id with an existing one"
            );
            return;
        }

        if new_entry.verified() {
            if inner.entries.len() < MAX_BUCKET_SIZE_K {
                inner.modify_main_bucket(None, Some(new_entry));
                return;
            }

            if let Some(bad) = inner.entries.iter().find(|e| e.needs_replacement()).cloned() {
                inner.modify_main_bucket(Some(&bad), Some(new_entry));
                return;
            }

            if let Some(youngest) = inner.entries.last().cloned() {
                if youngest.created > new_entry.created
                    || new_entry.rtt().mul_f64(2.5) < youngest.rtt()
                {
                    inner.modify_main_bucket(Some(&youngest), Some(new_entry));
                    inner.replacements.insert(youngest);
                    return;
                }
            }
        }

        inner.replacements.insert(new_entry);
    }

    /// Merge `entry` into a matching main or replacement entry. Never inserts.
    pub fn refresh(&self, entry: &KBucketEntry) -> bool {
        let mut inner = self.lock();

        if let Some(index) = inner.entries.iter().position(|e| e.same_contact(entry)) {
            Arc::make_mut(&mut inner.entries)[index].merge_in_timestamps(entry);
            return true;
        }

        if let Some(existing) = inner
            .replacements
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.same_contact(entry))
        {
            existing.merge_in_timestamps(entry);
            return true;
        }

        false
    }

    /// A verified response from `id` at `address` took `rtt`.
    pub fn notify_of_response(&self, id: &Id, address: SocketAddr, rtt: Option<Duration>) {
        let mut inner = self.lock();

        if let Some(index) = inner
            .entries
            .iter()
            .position(|e| e.id == *id && e.address == address)
        {
            Arc::make_mut(&mut inner.entries)[index].signal_response(rtt);
        }
    }

    pub fn on_send(&self, address: SocketAddr) {
        let mut inner = self.lock();

        if let Some(index) = inner.entries.iter().position(|e| e.address == address) {
            Arc::make_mut(&mut inner.entries)[index].signal_scheduled_request();
        }
    }

    /// A call to `address` timed out.
    pub fn on_timeout(&self, address: SocketAddr) {
        let mut inner = self.lock();

        if let Some(index) = inner.entries.iter().position(|e| e.address == address) {
            let entry = &mut Arc::make_mut(&mut inner.entries)[index];
            entry.signal_request_timeout();

            let entry = entry.clone();
            inner.remove_entry_if_bad(&entry, false);
            return;
        }

        if let Some(entry) = inner
            .replacements
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.address == address)
        {
            entry.signal_request_timeout();
        }
    }

    /// Remove `entry` if it needs replacement and a verified replacement is
    /// available, or unconditionally with `force`.
    pub fn remove_entry_if_bad(&self, entry: &KBucketEntry, force: bool) {
        self.lock().remove_entry_if_bad(entry, force)
    }

    /// Replace an entry needing replacement, or fill a free slot, with the
    /// best verified replacement.
    pub fn promote_verified_replacement(&self) {
        let mut inner = self.lock();

        let to_remove = inner.entries.iter().find(|e| e.needs_replacement()).cloned();

        if to_remove.is_none() && inner.entries.len() >= MAX_BUCKET_SIZE_K {
            return;
        }

        if let Some(replacement) = inner.replacements.poll_verified() {
            inner.modify_main_bucket(to_remove.as_ref(), Some(replacement));
        }
    }

    /// Remove and/or insert into the main list.
    ///
    /// Inserts into a full bucket only succeed for entries older than the
    /// youngest one, which is then pushed to the replacement ring.
    pub fn modify_main_bucket(
        &self,
        to_remove: Option<&KBucketEntry>,
        to_insert: Option<KBucketEntry>,
    ) -> bool {
        self.lock().modify_main_bucket(to_remove, to_insert)
    }

    /// Drop an entry from the replacement ring.
    pub fn remove_replacement(&self, entry: &KBucketEntry) {
        self.lock().replacements.remove(entry)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn modify_main_bucket(
        &mut self,
        to_remove: Option<&KBucketEntry>,
        to_insert: Option<KBucketEntry>,
    ) -> bool {
        let mut removed = false;
        let mut added = false;

        if let Some(to_remove) = to_remove {
            if let Some(index) = self.entries.iter().position(|e| e.same_contact(to_remove)) {
                Arc::make_mut(&mut self.entries).remove(index);
                removed = true;
            }
        }

        if let Some(to_insert) = to_insert {
            if self.entries.iter().any(|e| e.match_ip_or_id(&to_insert)) {
                return removed;
            }

            let was_full = self.entries.len() >= MAX_BUCKET_SIZE_K;
            let unordered_insert = self
                .entries
                .last()
                .is_some_and(|youngest| to_insert.created < youngest.created);

            added = !was_full || unordered_insert;

            if added {
                self.replacements.remove(&to_insert);

                let entries = Arc::make_mut(&mut self.entries);
                entries.push(to_insert);

                if unordered_insert {
                    entries.sort_by(KBucketEntry::age_order);
                }

                if was_full {
                    if let Some(evicted) = entries.pop() {
                        self.replacements.insert(evicted);
                    }
                }
            }
        }

        added || removed
    }

    fn remove_entry_if_bad(&mut self, entry: &KBucketEntry, force: bool) {
        let Some(current) = self.entries.iter().find(|e| e.same_contact(entry)) else {
            return;
        };

        if !(force || current.needs_replacement()) {
            return;
        }

        let replacement = self.replacements.poll_verified();

        if replacement.is_some() || force {
            trace!(
                context = "kbucket_evict",
                id = %entry.id,
                address = ?entry.address,
                force,
                "Removing bad entry"
            );

            let current = current.clone();
            self.modify_main_bucket(Some(&current), replacement);
        }
    }
}

impl ReplacementRing {
    /// Insert at the slot after the pointer, if the incumbent there may be
    /// overwritten. Duplicates by ip or id are merged or skipped.
    fn insert(&mut self, to_insert: KBucketEntry) {
        let insertion_point = (self.pointer + 1) & (REPLACEMENT_BUCKET_SIZE - 1);

        let can_overwrite = match &self.slots[insertion_point] {
            None => true,
            Some(to_overwrite) => {
                let linger_time = if to_overwrite.verified && !to_insert.verified {
                    VERIFIED_LINGER_TIME
                } else {
                    LINGER_TIME
                };

                let fresher = to_insert
                    .last_seen
                    .duration_since(to_overwrite.last_seen)
                    .is_ok_and(|d| d > linger_time);

                fresher || to_insert.rtt() < to_overwrite.rtt()
            }
        };

        if !can_overwrite {
            return;
        }

        if let Some(duplicate) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.match_ip_or_id(&to_insert))
        {
            if duplicate.same_contact(&to_insert) {
                duplicate.merge_in_timestamps(&to_insert);
            }
            return;
        }

        self.slots[insertion_point] = Some(to_insert);
        self.pointer = insertion_point;
    }

    /// Take the verified entry with the lowest rtt, most recently seen on ties.
    fn poll_verified(&mut self) -> Option<KBucketEntry> {
        let mut best: Option<(usize, &KBucketEntry)> = None;

        for (i, entry) in self.slots.iter().enumerate() {
            let Some(entry) = entry else { continue };

            if !entry.verified {
                continue;
            }

            let is_better = match best {
                None => true,
                Some((_, found)) => {
                    entry.rtt() < found.rtt()
                        || (entry.rtt() == found.rtt() && entry.last_seen > found.last_seen)
                }
            };

            if is_better {
                best = Some((i, entry));
            }
        }

        let index = best?.0;

        self.pointer = index.wrapping_sub(1) & (REPLACEMENT_BUCKET_SIZE - 1);
        self.slots[index].take()
    }

    fn remove(&mut self, entry: &KBucketEntry) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.same_contact(entry)) {
                *slot = None;
            }
        }
    }
}
