//! Owner of the routing table: trust policy, insertion, split and merge.
use std::{
    cmp::Ordering,
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    ops::BitOr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use lru::LruCache;
use tracing::{debug, trace};

use super::{
    kbucket_entry::since, KBucket, KBucketEntry, RoutingTable, RoutingTableEntry, MIN_PING_INTERVAL,
};
use crate::common::{ClosestNodes, Contact, Id, MAX_BUCKET_SIZE_K, MAX_DEPTH};
use crate::rpc::{InboundMessage, RpcCall, SerializedExecutor};

const THROTTLE_INCREMENT: u32 = 10;
const THROTTLE_SATURATION: u32 = 60;
const THROTTLE_THRESHOLD: u32 = 30;
const THROTTLE_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Flags controlling [Node::insert_entry].
pub struct InsertOptions(u8);

impl InsertOptions {
    /// Never split the owning bucket.
    pub const NEVER_SPLIT: InsertOptions = InsertOptions(1);
    /// Insert into the main list instead of [KBucket::insert_or_refresh].
    pub const FORCE_INTO_MAIN_BUCKET: InsertOptions = InsertOptions(1 << 1);
    /// Split full buckets without checking [Node::can_split].
    pub const ALWAYS_SPLIT_IF_FULL: InsertOptions = InsertOptions(1 << 2);
    /// Allow non-home buckets to split for entries among the closest to us.
    pub const RELAXED_SPLIT: InsertOptions = InsertOptions(1 << 3);

    pub fn contains(&self, other: InsertOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for InsertOptions {
    type Output = InsertOptions;

    fn bitor(self, rhs: InsertOptions) -> InsertOptions {
        InsertOptions(self.0 | rhs.0)
    }
}

#[derive(Debug, Default)]
/// Work the owner of the [Node] should carry out after [Node::bucket_maintenance].
pub struct MaintenanceDecisions {
    /// Entries to ping, with the id they are expected to answer with.
    pub nodes_to_ping: Vec<Contact>,
    /// `find_node` lookups to refresh stale buckets: who to ask and what for.
    pub refresh_lookups: Vec<(Contact, Id)>,
    /// The table has no entries at all.
    pub should_bootstrap: bool,
}

/// The routing table owner.
///
/// Inbound messages are applied one at a time through a serializing
/// executor. Readers take cheap snapshots with [Node::table]; structural
/// changes install a new [RoutingTable] under a split lock.
pub struct Node {
    id: Id,
    table: RwLock<Arc<RoutingTable>>,
    split_lock: Mutex<()>,
    executor: SerializedExecutor<InboundMessage>,
    unsolicited_throttle: Mutex<LruCache<IpAddr, u32>>,
    pings: (flume::Sender<Contact>, flume::Receiver<Contact>),
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("buckets", &self.table().len())
            .field("entries", &self.table().num_entries())
            .finish()
    }
}

impl Node {
    pub fn new(id: Id) -> Self {
        Node {
            id,
            table: RwLock::new(Arc::new(RoutingTable::new())),
            split_lock: Mutex::new(()),
            executor: SerializedExecutor::new(),
            unsolicited_throttle: Mutex::new(LruCache::new(
                NonZeroUsize::new(THROTTLE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            pings: flume::unbounded(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Current snapshot of the routing table.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_table(&self, table: RoutingTable) {
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    fn lock_split(&self) -> MutexGuard<'_, ()> {
        self.split_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_local_id(&self, id: &Id) -> bool {
        self.id == *id
    }

    /// Contacts good enough to share, closest to `target` first.
    pub fn closest(&self, target: &Id, k: usize) -> ClosestNodes {
        self.table().closest(target, k)
    }

    /// Entries the node decided to ping since the last call.
    pub fn take_pending_pings(&self) -> Vec<Contact> {
        self.pings.1.try_iter().collect()
    }

    /// Log2 of the estimated number of nodes in the network, from the
    /// distribution of our closest entries.
    pub fn log2_size_estimate(&self) -> f64 {
        let closest = self
            .table()
            .closest_with(&self.id, MAX_BUCKET_SIZE_K, |_| true);

        let estimate = closest.dht_size_estimate();

        if estimate < 1.0 {
            0.0
        } else {
            estimate.log2()
        }
    }

    // === Inbound ===

    /// Apply an inbound message to the routing table.
    ///
    /// Concurrent callers hand their message over to whoever is already
    /// processing, at most one message is applied at a time.
    pub fn received(&self, inbound: InboundMessage) {
        self.executor.submit(inbound, |inbound| self.process(inbound));
    }

    fn process(&self, inbound: InboundMessage) {
        let InboundMessage {
            message,
            from,
            call,
        } = inbound;

        let Some(id) = message.author_id() else {
            return;
        };

        if message.read_only || from.port() == 0 || self.is_local_id(&id) {
            return;
        }

        let verified_response = message.is_response() && call.is_some();
        let table = self.table();

        if let Some((rte, existing)) = table.find_by_ip(from.ip()) {
            if existing.address != from || existing.id != id {
                if verified_response {
                    debug!(
                        context = "routing_trust",
                        old_id = %existing.id,
                        old_address = ?existing.address,
                        new_id = %id,
                        ?from,
                        "Node changed id or port, evicting the stale entry"
                    );

                    rte.bucket.remove_entry_if_bad(&existing, true);
                    self.check_bucket_integrity(&rte.bucket);
                }

                return;
            }
        }

        let rte = table.entry_for_id(&id);
        let existing = rte.bucket.entries().iter().find(|e| e.id == id).cloned();

        if let Some(existing) = &existing {
            if existing.address.ip() != from.ip() {
                trace!(
                    context = "routing_trust",
                    %id,
                    known = ?existing.address,
                    ?from,
                    "Ignoring id claimed from a different ip"
                );
                return;
            }
        } else if let Some(expected) = call.as_ref().and_then(|c| c.expected_id()) {
            if expected != id {
                debug!(
                    context = "routing_trust",
                    %expected,
                    actual = %id,
                    ?from,
                    "Response id doesn't match the expected id"
                );
                return;
            }
        }

        let mut new_entry = KBucketEntry::new(id, from);
        new_entry.set_version(message.version.clone());

        let mut options = InsertOptions::default();

        match &call {
            Some(call) if message.is_response() => {
                new_entry.signal_response(call.rtt());
                if let Some(sent_at) = call.sent_at() {
                    new_entry.merge_request_time(sent_at);
                }
                options = options | InsertOptions::RELAXED_SPLIT;
            }
            _ => {
                if self.unsolicited_throttled(from.ip()) {
                    trace!(context = "routing_throttle", ?from, "Throttling unsolicited insert");
                    rte.bucket.refresh(&new_entry);
                    return;
                }
            }
        }

        self.insert_entry(new_entry, options);

        if let Some(call) = &call {
            if message.is_response() {
                self.table()
                    .entry_for_id(&id)
                    .bucket
                    .notify_of_response(&id, from, call.rtt());
            }
        }
    }

    /// Ping the entries of a bucket we just found an impersonation or id
    /// change in.
    fn check_bucket_integrity(&self, bucket: &KBucket) {
        for entry in bucket.entries().iter() {
            if since(entry.last_seen) >= MIN_PING_INTERVAL {
                let _ = self.pings.0.send(entry.contact());
            }
        }
    }

    fn unsolicited_throttled(&self, ip: IpAddr) -> bool {
        let mut throttle = self
            .unsolicited_throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let counter = throttle.get_or_insert_mut(ip, || 0);
        let previous = *counter;
        *counter = (previous + THROTTLE_INCREMENT).min(THROTTLE_SATURATION);

        previous >= THROTTLE_THRESHOLD
    }

    /// Decrement every unsolicited insert counter by one, meant to run once per second.
    pub fn decay_throttle(&self) {
        let mut throttle = self
            .unsolicited_throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let expired: Vec<IpAddr> = throttle
            .iter_mut()
            .filter_map(|(ip, counter)| {
                *counter = counter.saturating_sub(1);
                (*counter == 0).then_some(*ip)
            })
            .collect();

        for ip in expired {
            throttle.pop(&ip);
        }
    }

    // === Insertion ===

    pub fn insert_entry(&self, entry: KBucketEntry, options: InsertOptions) {
        if self.is_local_id(&entry.id) || entry.address.port() == 0 {
            return;
        }

        let mut table = self.table();
        let mut rte = table.entry_for_id(&entry.id).clone();

        while !options.contains(InsertOptions::NEVER_SPLIT)
            && rte.bucket.is_full()
            && (options.contains(InsertOptions::FORCE_INTO_MAIN_BUCKET) || entry.verified())
            && rte.prefix.depth() < MAX_DEPTH
        {
            if !options.contains(InsertOptions::ALWAYS_SPLIT_IF_FULL)
                && !self.can_split(&table, &rte, &entry, options.contains(InsertOptions::RELAXED_SPLIT))
            {
                break;
            }

            self.split_entry(&table, &rte);

            table = self.table();
            rte = table.entry_for_id(&entry.id).clone();
        }

        if options.contains(InsertOptions::FORCE_INTO_MAIN_BUCKET) {
            let existing = rte.bucket.find_by_ip_or_id(entry.address.ip(), &entry.id);
            rte.bucket.modify_main_bucket(existing.as_ref(), Some(entry));
        } else {
            rte.bucket.insert_or_refresh(entry);
        }
    }

    /// Home buckets always split. Others only in relaxed mode, and only if
    /// `entry` would be among the [MAX_BUCKET_SIZE_K] entries closest to us.
    fn can_split(
        &self,
        table: &RoutingTable,
        rte: &RoutingTableEntry,
        entry: &KBucketEntry,
        relaxed: bool,
    ) -> bool {
        if rte.home_bucket {
            return true;
        }

        if !relaxed {
            return false;
        }

        let closest = table.closest_with(&self.id, MAX_BUCKET_SIZE_K, |_| true);

        if closest.len() < MAX_BUCKET_SIZE_K {
            return true;
        }

        closest
            .furthest()
            .is_some_and(|furthest| {
                self.id.three_way_distance(&furthest.id, &entry.id) == Ordering::Greater
            })
    }

    /// Replace `to_split` by its two halves, if `expected` is still the
    /// current table.
    fn split_entry(&self, expected: &Arc<RoutingTable>, to_split: &RoutingTableEntry) {
        let replacements = {
            let _guard = self.lock_split();

            let current = self.table();
            if !Arc::ptr_eq(&current, expected) {
                return;
            }

            let children: Vec<RoutingTableEntry> = [false, true]
                .into_iter()
                .map(|high| {
                    let prefix = to_split.prefix.split_prefix_branch(high);
                    RoutingTableEntry::new(
                        prefix,
                        Arc::new(KBucket::new()),
                        prefix.is_prefix_of(&self.id),
                    )
                })
                .collect();

            trace!(
                context = "routing_split",
                prefix = %to_split.prefix,
                buckets = current.len() + 1,
                "Splitting bucket"
            );

            self.set_table(current.modify(&[to_split.prefix], children));

            for entry in to_split.bucket.entries().iter() {
                self.insert_entry(
                    entry.clone(),
                    InsertOptions::NEVER_SPLIT | InsertOptions::FORCE_INTO_MAIN_BUCKET,
                );
            }

            to_split.bucket.replacement_entries()
        };

        for entry in replacements {
            self.insert_entry(entry, InsertOptions::default());
        }
    }

    /// Fold sibling buckets back together when they got sparse.
    ///
    /// Each merge removes one bucket and anything else advances the cursor,
    /// so the scan stops after at most three times the initial number of
    /// buckets iterations.
    pub fn merge_buckets(&self) {
        let _guard = self.lock_split();

        let max_iterations = 3 * self.table().len();
        let mut i = 0;

        for _ in 0..max_iterations {
            let table = self.table();

            if i + 1 >= table.len() {
                break;
            }

            let a = &table.entries()[i];
            let b = &table.entries()[i + 1];

            if !a.prefix.is_sibling_of(&b.prefix) {
                i += 1;
                continue;
            }

            let effective_a = effective_size(&a.bucket);
            let effective_b = effective_size(&b.bucket);

            let parent = a.prefix.parent();
            let home_bucket = parent.is_prefix_of(&self.id);

            if effective_a == 0 || effective_b == 0 {
                let keep = if effective_a == 0 { b } else { a };

                trace!(context = "routing_merge", prefix = %keep.prefix, "Lifting bucket to parent");

                self.set_table(table.modify(
                    &[a.prefix, b.prefix],
                    vec![RoutingTableEntry::new(parent, keep.bucket.clone(), home_bucket)],
                ));

                i = i.saturating_sub(1);
            } else if effective_a + effective_b <= MAX_BUCKET_SIZE_K {
                trace!(context = "routing_merge", prefix = %parent, "Merging siblings");

                self.set_table(table.modify(
                    &[a.prefix, b.prefix],
                    vec![RoutingTableEntry::new(parent, Arc::new(KBucket::new()), home_bucket)],
                ));

                for entry in a.bucket.entries().iter().chain(b.bucket.entries().iter()) {
                    self.insert_entry(
                        entry.clone(),
                        InsertOptions::NEVER_SPLIT | InsertOptions::FORCE_INTO_MAIN_BUCKET,
                    );
                }

                for entry in a
                    .bucket
                    .replacement_entries()
                    .into_iter()
                    .chain(b.bucket.replacement_entries())
                {
                    self.insert_entry(entry, InsertOptions::NEVER_SPLIT);
                }

                i = i.saturating_sub(1);
            } else {
                i += 1;
            }
        }
    }

    // === Call outcomes ===

    pub fn on_timeout(&self, call: &RpcCall) {
        // A response came back from another socket, the destination may be fine.
        if call.socket_mismatch() {
            return;
        }

        let address = call.destination();
        let table = self.table();

        match call.expected_id() {
            Some(id) => table.entry_for_id(&id).bucket.on_timeout(address),
            None => {
                if let Some((rte, _)) = table.find_by_ip(address.ip()) {
                    rte.bucket.on_timeout(address)
                }
            }
        }
    }

    pub fn on_send(&self, address: SocketAddr, expected_id: Option<Id>) {
        let table = self.table();

        match expected_id {
            Some(id) => table.entry_for_id(&id).bucket.on_send(address),
            None => {
                if let Some((rte, _)) = table.find_by_ip(address.ip()) {
                    rte.bucket.on_send(address)
                }
            }
        }
    }

    // === Maintenance ===

    /// Merge sparse buckets, clean up and promote entries, and decide which
    /// entries to ping and which buckets to refresh.
    pub fn bucket_maintenance(&self) -> MaintenanceDecisions {
        self.merge_buckets();

        let table = self.table();
        let mut decisions = MaintenanceDecisions {
            should_bootstrap: table.is_empty(),
            ..Default::default()
        };

        for rte in table.entries() {
            let bucket = &rte.bucket;

            if !rte.home_bucket && !bucket.is_full() {
                for entry in bucket.entries().iter() {
                    if entry.removable_without_replacement() {
                        bucket.remove_entry_if_bad(entry, true);
                    }
                }
            }

            for entry in bucket.entries().iter() {
                if !rte.prefix.is_prefix_of(&entry.id) {
                    bucket.remove_entry_if_bad(entry, true);
                    self.insert_entry(
                        entry.clone(),
                        InsertOptions::NEVER_SPLIT | InsertOptions::FORCE_INTO_MAIN_BUCKET,
                    );
                }
            }

            bucket.promote_verified_replacement();

            for entry in bucket.entries().iter().filter(|e| e.needs_ping()) {
                decisions.nodes_to_ping.push(entry.contact());
            }

            if !bucket.is_full() {
                if let Some(replacement) = bucket.find_pingable_replacement() {
                    decisions.nodes_to_ping.push(replacement.contact());
                }
            }

            if bucket.needs_to_be_refreshed() {
                let target = rte.prefix.create_random_key_from_prefix();

                let closest = table.closest_with(&target, 1, |e| {
                    rte.prefix.is_prefix_of(&e.id) && e.eligible_for_nodes_list()
                });

                if let Some(contact) = closest.nodes().first() {
                    decisions.refresh_lookups.push((*contact, target));
                }

                bucket.update_refresh_timer();
            }
        }

        decisions
    }
}

/// Entries worth keeping: main entries not dead, plus replacements good
/// enough to share.
fn effective_size(bucket: &KBucket) -> usize {
    let main = bucket
        .entries()
        .iter()
        .filter(|e| !e.removable_without_replacement())
        .count();

    let replacements = bucket
        .replacement_entries()
        .iter()
        .filter(|e| e.eligible_for_nodes_list())
        .count();

    main + replacements
}
