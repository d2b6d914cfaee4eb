//! Persisting the routing table across restarts.
//!
//! The snapshot is a bencoded dictionary holding the main entries, the
//! replacement candidates, the network size estimate and the id the table
//! was built around.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{InsertOptions, KBucketEntry, Node};
use crate::common::{bytes_to_sockaddr, sockaddr_to_bytes, Id};
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(rename = "mainEntries")]
    main_entries: Vec<StoredEntry>,
    replacements: Vec<StoredEntry>,
    /// Log2 of the size estimate, in millionths.
    #[serde(rename = "log2estimate")]
    log2_estimate: i64,
    /// Milliseconds since the unix epoch.
    timestamp: i64,
    #[serde(rename = "oldKey", with = "serde_bytes")]
    old_key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(with = "serde_bytes")]
    addr: Vec<u8>,
    #[serde(with = "serde_bytes")]
    id: Vec<u8>,
    created: i64,
    #[serde(rename = "lastSeen")]
    last_seen: i64,
    #[serde(rename = "lastSend", default, skip_serializing_if = "Option::is_none")]
    last_send: Option<i64>,
    #[serde(rename = "failedCount")]
    failed_count: i64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    version: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verified: Option<i64>,
}

#[derive(Debug, Clone)]
/// The persisted state of a [Node].
pub struct Snapshot {
    pub old_key: Id,
    pub main_entries: Vec<KBucketEntry>,
    pub replacements: Vec<KBucketEntry>,
    pub log2_estimate: f64,
    pub timestamp: SystemTime,
}

impl Snapshot {
    /// Copy every entry of the node's current table.
    pub fn capture(node: &Node) -> Snapshot {
        let table = node.table();

        let mut main_entries = vec![];
        let mut replacements = vec![];

        for rte in table.entries() {
            main_entries.extend(rte.bucket.entries().iter().cloned());
            replacements.extend(rte.bucket.replacement_entries());
        }

        Snapshot {
            old_key: *node.id(),
            main_entries,
            replacements,
            log2_estimate: node.log2_size_estimate(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = SnapshotFile {
            main_entries: self.main_entries.iter().map(StoredEntry::from).collect(),
            replacements: self.replacements.iter().map(StoredEntry::from).collect(),
            log2_estimate: (self.log2_estimate * 1_000_000.0) as i64,
            timestamp: to_millis(self.timestamp),
            old_key: self.old_key.to_vec(),
        };

        Ok(serde_bencode::to_bytes(&file)?)
    }

    /// Decode a snapshot, skipping entries with a malformed address or id.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Snapshot> {
        let file: SnapshotFile = serde_bencode::from_bytes(bytes.as_ref())?;

        Ok(Snapshot {
            old_key: Id::from_bytes(&file.old_key)?,
            main_entries: file.main_entries.iter().filter_map(decode_entry).collect(),
            replacements: file.replacements.iter().filter_map(decode_entry).collect(),
            log2_estimate: file.log2_estimate as f64 / 1_000_000.0,
            timestamp: from_millis(file.timestamp),
        })
    }

    /// Write to a temporary file next to `path`, then rename it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);

        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Read the snapshot at `path`, `None` if there is none.
    pub fn load(path: &Path) -> Result<Option<Snapshot>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(Self::from_bytes(bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Reinsert the stored entries into `node`.
    ///
    /// If the node's id changed since the snapshot was taken, entries closest
    /// to the new id go first so they claim the deep buckets.
    pub fn restore(mut self, node: &Node) {
        if self.old_key != *node.id() {
            let id = *node.id();
            let by_distance = |a: &KBucketEntry, b: &KBucketEntry| id.three_way_distance(&a.id, &b.id);

            self.main_entries.sort_by(by_distance);
            self.replacements.sort_by(by_distance);
        }

        debug!(
            context = "routing_snapshot",
            main = self.main_entries.len(),
            replacements = self.replacements.len(),
            "Restoring routing table"
        );

        for entry in self.main_entries {
            node.insert_entry(
                entry,
                InsertOptions::ALWAYS_SPLIT_IF_FULL | InsertOptions::FORCE_INTO_MAIN_BUCKET,
            );
        }

        for entry in self.replacements {
            node.insert_entry(entry, InsertOptions::default());
        }
    }
}

impl From<&KBucketEntry> for StoredEntry {
    fn from(entry: &KBucketEntry) -> Self {
        StoredEntry {
            addr: sockaddr_to_bytes(&entry.address),
            id: entry.id.to_vec(),
            created: to_millis(entry.created),
            last_seen: to_millis(entry.last_seen),
            last_send: entry.last_send.map(to_millis),
            failed_count: entry.failed_queries as i64,
            version: entry.version.clone(),
            verified: entry.verified.then_some(1),
        }
    }
}

fn decode_entry(stored: &StoredEntry) -> Option<KBucketEntry> {
    let (Ok(id), Ok(address)) = (Id::from_bytes(&stored.id), bytes_to_sockaddr(&stored.addr)) else {
        debug!(context = "routing_snapshot", addr = ?stored.addr, "Skipping malformed entry");
        return None;
    };

    let mut entry = KBucketEntry::new(id, address);
    entry.created = from_millis(stored.created);
    entry.last_seen = from_millis(stored.last_seen);
    entry.last_send = stored.last_send.map(from_millis);
    entry.failed_queries = stored.failed_count.clamp(0, u32::MAX as i64) as u32;
    entry.version = stored.version.clone();
    entry.verified = stored.verified.is_some_and(|v| v != 0);

    Some(entry)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn from_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}
