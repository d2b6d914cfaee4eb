//! End to end behavior of a small network of nodes over loopback.
//!
//! Run with: cargo test --test testnet
//!
//! Set `KRPC_DHT_LOG` to see the nodes' logs, for example `KRPC_DHT_LOG=trace`.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use tracing::Level;

use krpc_dht::{Dht, Error, Id, Testnet, MAX_BUCKET_SIZE_K};

fn init_tracing() {
    let Ok(level) = std::env::var("KRPC_DHT_LOG") else {
        return;
    };

    let level = level.parse().unwrap_or(Level::DEBUG);

    // Every test calls this, only the first one installs the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }

    condition()
}

#[test]
fn testnet_nodes_know_each_other() {
    init_tracing();

    let testnet = Testnet::new(6).unwrap();

    for node in &testnet.nodes {
        let table = node.routing_table();
        assert_eq!(table.num_entries(), 5, "{} should know every other node", node.id());

        for entry in table.entries().iter().flat_map(|rte| rte.bucket.entries().to_vec()) {
            assert!(entry.verified());
        }
    }
}

#[test]
fn find_node_returns_closest_known() {
    init_tracing();

    let testnet = Testnet::new(10).unwrap();
    let asker = &testnet.nodes[0];
    let remote = &testnet.nodes[1];
    let target = Id::random();

    let contacts = asker.find_node(remote.local_addr(), target).unwrap();

    let expected = remote.routing_table().closest(&target, MAX_BUCKET_SIZE_K);
    assert_eq!(contacts.len(), MAX_BUCKET_SIZE_K);
    assert_eq!(contacts, expected.nodes());
}

#[test]
fn bootstrap_fills_the_table() {
    init_tracing();

    let testnet = Testnet::new(12).unwrap();

    let dht = Dht::builder()
        .port(0)
        .bind_address(IpAddr::V4(Ipv4Addr::new(127, 0, 2, 1)))
        .bootstrap(&testnet.bootstrap[..1])
        .build()
        .unwrap();

    // One bootstrap node hands out up to K contacts, which get pinged and verified.
    assert!(wait_for(Duration::from_secs(5), || {
        dht.routing_table().num_entries() > 1
    }));

    let table = dht.routing_table();
    assert!(table.check_partition());
    assert!(!table
        .entries()
        .iter()
        .any(|rte| rte.bucket.entries().iter().any(|e| e.id() == &dht.id())));
}

#[test]
fn ping_unreachable_times_out() {
    init_tracing();

    let dht = Dht::builder()
        .port(0)
        .bind_address(IpAddr::V4(Ipv4Addr::new(127, 0, 2, 2)))
        .no_bootstrap()
        .request_timeout(Duration::from_millis(400))
        .build()
        .unwrap();

    // Nothing listens there.
    let nowhere = SocketAddr::from(([127, 0, 2, 3], 9));

    let start = Instant::now();
    let result = dht.ping(nowhere);

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(wait_for(Duration::from_secs(1), || dht.rpc().active_calls() == 0));
}

#[test]
fn concurrent_pings() {
    init_tracing();

    let testnet = Testnet::new(4).unwrap();
    let dht = Dht::builder()
        .port(0)
        .bind_address(IpAddr::V4(Ipv4Addr::new(127, 0, 2, 4)))
        .no_bootstrap()
        .build()
        .unwrap();

    let handles: Vec<_> = testnet
        .nodes
        .iter()
        .map(|node| {
            let dht = dht.clone();
            let address = node.local_addr();
            thread::spawn(move || dht.ping(address))
        })
        .collect();

    let ids: Vec<Id> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    for node in &testnet.nodes {
        assert!(ids.contains(&node.id()));
    }

    assert_eq!(dht.routing_table().num_entries(), testnet.nodes.len());
}

#[test]
fn shutdown_stops_answering() {
    init_tracing();

    let testnet = Testnet::new(2).unwrap();
    let address = testnet.nodes[1].local_addr();

    testnet.nodes[1].shutdown();

    let result = testnet.nodes[0].ping(address);
    assert!(result.is_err());
}
