//! Immutable snapshot of the keyspace partition.
use std::{fmt, net::IpAddr, sync::Arc};

use crate::common::{ClosestNodes, Id, Prefix};

use super::{KBucket, KBucketEntry};

/// Upper bound on the jump table size, in bits of the id.
const MAX_INDEX_BITS: u32 = 16;

#[derive(Debug, Clone)]
/// A prefix and the bucket holding the entries it covers.
pub struct RoutingTableEntry {
    pub prefix: Prefix,
    pub bucket: Arc<KBucket>,
    /// The prefix covers our own id.
    pub home_bucket: bool,
}

impl RoutingTableEntry {
    pub fn new(prefix: Prefix, bucket: Arc<KBucket>, home_bucket: bool) -> Self {
        RoutingTableEntry {
            prefix,
            bucket,
            home_bucket,
        }
    }
}

/// Sorted, non-overlapping prefixes covering the whole keyspace.
///
/// Never mutated, [RoutingTable::modify] builds a new table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: Vec<RoutingTableEntry>,
    /// `index_cache[i]` is the entry covering the first key whose top
    /// `index_bits` bits equal `i`.
    index_cache: Vec<usize>,
    index_bits: u32,
}

impl RoutingTable {
    /// A table with one home bucket covering the whole keyspace.
    pub fn new() -> Self {
        Self::from_entries(vec![RoutingTableEntry::new(
            Prefix::WHOLE_KEYSPACE,
            Arc::new(KBucket::new()),
            true,
        )])
    }

    fn from_entries(mut entries: Vec<RoutingTableEntry>) -> Self {
        entries.sort_by(|a, b| a.prefix.cmp(&b.prefix));

        let mut table = RoutingTable {
            entries,
            index_cache: vec![0],
            index_bits: 0,
        };
        table.build_index();
        table
    }

    fn build_index(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let bits = (self.entries.len().next_power_of_two().trailing_zeros()).min(MAX_INDEX_BITS);
        let size = 1_usize << bits;

        let mut cache = Vec::with_capacity(size);
        for slot in 0..size {
            let mut key = Id::MIN;
            let top = if bits == 0 {
                0
            } else {
                (slot as u32) << (32 - bits)
            };
            key.0[..4].copy_from_slice(&top.to_be_bytes());

            cache.push(self.search(&key, 0, self.entries.len() - 1));
        }

        self.index_cache = cache;
        self.index_bits = bits;
    }

    /// Last entry in `lo..=hi` whose first key is not above `id`.
    fn search(&self, id: &Id, lo: usize, hi: usize) -> usize {
        let n = self.entries[lo..=hi].partition_point(|e| e.prefix.first() <= *id);

        lo + n.saturating_sub(1)
    }

    // === Getters ===

    pub fn entries(&self) -> &[RoutingTableEntry] {
        &self.entries
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Number of entries across all main lists.
    pub fn num_entries(&self) -> usize {
        self.entries.iter().map(|e| e.bucket.num_entries()).sum()
    }

    pub fn num_replacements(&self) -> usize {
        self.entries.iter().map(|e| e.bucket.num_replacements()).sum()
    }

    /// Index of the unique entry whose prefix covers `id`.
    pub fn index_for_id(&self, id: &Id) -> usize {
        let (lo, hi) = if self.index_bits == 0 {
            (0, self.entries.len() - 1)
        } else {
            let slot = (id.top_u32() >> (32 - self.index_bits)) as usize;
            let lo = self.index_cache[slot];
            let hi = self
                .index_cache
                .get(slot + 1)
                .copied()
                .unwrap_or(self.entries.len() - 1);
            (lo, hi)
        };

        self.search(id, lo, hi)
    }

    pub fn entry_for_id(&self, id: &Id) -> &RoutingTableEntry {
        &self.entries[self.index_for_id(id)]
    }

    /// The entry with exactly this prefix.
    pub fn entry_for_prefix(&self, prefix: &Prefix) -> Option<&RoutingTableEntry> {
        self.entries
            .binary_search_by(|e| e.prefix.cmp(prefix))
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Scan every main list for an entry at `ip`.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<(&RoutingTableEntry, KBucketEntry)> {
        self.entries.iter().find_map(|rte| {
            rte.bucket
                .entries()
                .iter()
                .find(|e| e.address.ip() == ip)
                .map(|e| (rte, e.clone()))
        })
    }

    /// Main entries accepted by `filter`, sorted by distance to `target`,
    /// at most `k` of them.
    pub fn closest_with<F>(&self, target: &Id, k: usize, filter: F) -> ClosestNodes
    where
        F: Fn(&KBucketEntry) -> bool,
    {
        let mut closest = ClosestNodes::new(*target);

        for rte in &self.entries {
            for entry in rte.bucket.entries().iter().filter(|e| filter(*e)) {
                closest.add(entry.contact());
            }
        }

        closest.truncate(k);
        closest
    }

    /// The `k` closest entries good enough to share with other nodes.
    pub fn closest(&self, target: &Id, k: usize) -> ClosestNodes {
        self.closest_with(target, k, KBucketEntry::eligible_for_nodes_list)
    }

    // === Public Methods ===

    /// A new table without the entries with prefixes in `to_remove`, plus `to_add`.
    pub fn modify(&self, to_remove: &[Prefix], to_add: Vec<RoutingTableEntry>) -> RoutingTable {
        let mut entries: Vec<RoutingTableEntry> = self
            .entries
            .iter()
            .filter(|e| !to_remove.contains(&e.prefix))
            .cloned()
            .collect();

        entries.extend(to_add);

        Self::from_entries(entries)
    }

    /// Whether the prefixes are sorted, disjoint and cover the whole keyspace.
    pub fn check_partition(&self) -> bool {
        let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) else {
            return false;
        };

        if first.prefix.first() != Id::MIN || last.prefix.last() != Id::MAX {
            return false;
        }

        self.entries
            .windows(2)
            .all(|w| successor(&w[0].prefix.last()) == Some(w[1].prefix.first()))
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rte in &self.entries {
            writeln!(
                f,
                "{}{} entries: {} replacements: {}",
                rte.prefix,
                if rte.home_bucket { " [home]" } else { "" },
                rte.bucket.num_entries(),
                rte.bucket.num_replacements()
            )?;
        }
        Ok(())
    }
}

fn successor(id: &Id) -> Option<Id> {
    let mut next = *id;

    for byte in next.0.iter_mut().rev() {
        if *byte == 0xff {
            *byte = 0;
        } else {
            *byte += 1;
            return Some(next);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn split(table: &RoutingTable, prefix: Prefix) -> RoutingTable {
        table.modify(
            &[prefix],
            vec![
                RoutingTableEntry::new(
                    prefix.split_prefix_branch(false),
                    Arc::new(KBucket::new()),
                    false,
                ),
                RoutingTableEntry::new(
                    prefix.split_prefix_branch(true),
                    Arc::new(KBucket::new()),
                    false,
                ),
            ],
        )
    }

    #[test]
    fn index_for_id_matches_linear_scan() {
        let mut table = RoutingTable::new();

        for _ in 0..300 {
            let target = Id::random();
            let prefix = table.entry_for_id(&target).prefix;
            if prefix.depth() < 40 {
                table = split(&table, prefix);
            }

            assert!(table.check_partition());
        }

        for _ in 0..2000 {
            let id = Id::random();
            let index = table.index_for_id(&id);

            let matching: Vec<_> = table
                .entries()
                .iter()
                .enumerate()
                .filter(|(_, e)| e.prefix.is_prefix_of(&id))
                .map(|(i, _)| i)
                .collect();

            assert_eq!(matching, vec![index]);
        }

        assert_eq!(table.index_for_id(&Id::MIN), 0);
        assert_eq!(table.index_for_id(&Id::MAX), table.len() - 1);
    }

    #[test]
    fn deep_splits_near_one_key() {
        let id = Id::random();
        let mut table = RoutingTable::new();

        for _ in 0..160 {
            let prefix = table.entry_for_id(&id).prefix;
            table = split(&table, prefix);
        }

        assert_eq!(table.len(), 161);
        assert!(table.check_partition());
        assert_eq!(table.entry_for_id(&id).prefix.depth(), 159);
        assert_eq!(table.entry_for_id(&id).prefix.first(), id);
    }

    #[test]
    fn modify_keeps_buckets() {
        let table = RoutingTable::new();
        let bucket = table.entries()[0].bucket.clone();

        let table = split(&table, Prefix::WHOLE_KEYSPACE);
        assert_eq!(table.len(), 2);
        assert!(!table.entries().iter().any(|e| Arc::ptr_eq(&e.bucket, &bucket)));
        assert!(table.entry_for_prefix(&Prefix::WHOLE_KEYSPACE).is_none());

        let low = Prefix::WHOLE_KEYSPACE.split_prefix_branch(false);
        assert!(table.entry_for_prefix(&low).is_some());
    }

    #[test]
    fn broken_partition_is_detected() {
        let table = split(&RoutingTable::new(), Prefix::WHOLE_KEYSPACE);
        let high = Prefix::WHOLE_KEYSPACE.split_prefix_branch(true);

        let gap = table.modify(&[high], vec![]);
        assert!(!gap.check_partition());
    }
}
