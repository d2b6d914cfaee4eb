//! Micro-benchmarks for routing table operations: insert, closest, and
//! snapshot at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use std::net::SocketAddr;
use std::time::Instant;

use krpc_dht::{
    routing::{snapshot::Snapshot, InsertOptions, KBucketEntry, Node},
    Id, MAX_BUCKET_SIZE_K,
};

fn main() {
    println!("routing_table\n");

    bench_insert();
    bench_closest();
    bench_snapshot();
}

fn entries(count: u32, offset: u32) -> Vec<KBucketEntry> {
    (0..count)
        .map(|i| {
            let address = SocketAddr::from(((0x0a00_0000 + offset + i).to_be_bytes(), 6881));
            let mut entry = KBucketEntry::new(Id::random(), address);
            entry.signal_response(None);
            entry
        })
        .collect()
}

fn filled_node(size: u32) -> Node {
    let node = Node::new(Id::random());
    for entry in entries(size, 0) {
        node.insert_entry(entry, InsertOptions::default());
    }
    node
}

fn bench_insert() {
    println!("insert");

    for size in [0, 100, 1000] {
        let node = filled_node(size);
        let fresh = entries(1000, 1_000_000);

        let start = Instant::now();
        for entry in fresh {
            node.insert_entry(entry, InsertOptions::default());
        }
        let per_op = start.elapsed().as_nanos() / 1000;

        println!(
            "{size:>4} prefilled: {per_op}ns/op (final: {} entries in {} buckets)",
            node.table().num_entries(),
            node.table().len()
        );
    }

    println!();
}

fn bench_closest() {
    println!("closest");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 200, 1000, 5000] {
        let node = filled_node(size);

        let start = Instant::now();
        for target in &targets {
            let _ = node.closest(target, MAX_BUCKET_SIZE_K);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;

        println!("{size:>4} inserted: {per_op}ns/op");
    }

    println!();
}

fn bench_snapshot() {
    println!("snapshot");

    let node = filled_node(1000);

    let start = Instant::now();
    let bytes = Snapshot::capture(&node).to_bytes().unwrap();
    println!("capture + encode: {}us ({} bytes)", start.elapsed().as_micros(), bytes.len());

    let start = Instant::now();
    let restored = Node::new(Id::random());
    Snapshot::from_bytes(&bytes).unwrap().restore(&restored);
    println!(
        "decode + restore: {}us ({} entries)",
        start.elapsed().as_micros(),
        restored.table().num_entries()
    );

    println!();
}
