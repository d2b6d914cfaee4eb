//! Concurrent inserts into a routing table owner.
//!
//! Run with: cargo test --test routing_stress

use std::net::SocketAddr;

use rayon::prelude::*;

use krpc_dht::{
    routing::{InsertOptions, KBucketEntry, Node},
    Id, MAX_BUCKET_SIZE_K,
};

fn verified_entry(i: u32) -> KBucketEntry {
    let address = SocketAddr::from(((0x0a00_0000 + i).to_be_bytes(), 6881));
    let mut entry = KBucketEntry::new(Id::random(), address);
    entry.signal_response(None);
    entry
}

#[test]
fn parallel_inserts_keep_the_table_consistent() {
    let node = Node::new(Id::random());

    (0..5_000_u32).into_par_iter().for_each(|i| {
        node.insert_entry(verified_entry(i), InsertOptions::default());
    });

    let table = node.table();

    assert!(table.check_partition());
    assert!(table.len() > 1);

    for rte in table.entries() {
        let entries = rte.bucket.entries();
        assert!(entries.len() <= MAX_BUCKET_SIZE_K);

        for entry in entries.iter() {
            assert!(rte.prefix.is_prefix_of(entry.id()));
        }
    }

    let home = table.entry_for_id(node.id());
    assert!(home.home_bucket);
}

#[test]
fn parallel_reads_during_writes() {
    let node = Node::new(Id::random());

    (0..2_000_u32).into_par_iter().for_each(|i| {
        if i % 2 == 0 {
            node.insert_entry(verified_entry(i), InsertOptions::default());
        } else {
            let closest = node.closest(&Id::random(), MAX_BUCKET_SIZE_K);
            assert!(closest.len() <= MAX_BUCKET_SIZE_K);
        }
    });

    node.merge_buckets();

    assert!(node.table().check_partition());
}
