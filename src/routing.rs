//! Kademlia routing table: buckets, the keyspace partition and its owner.

mod kbucket;
mod kbucket_entry;
mod node;
mod routing_table;
pub mod snapshot;

pub use kbucket::*;
pub use kbucket_entry::*;
pub use node::*;
pub use routing_table::*;
