//! A remote node as it appears on the wire: an id and a socket address.
use std::net::SocketAddr;

use crate::common::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Remote node advertised in `nodes`/`nodes6` lists or returned from lookups.
pub struct Contact {
    pub id: Id,
    pub address: SocketAddr,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact { id, address }
    }

    /// Creates a random contact on a random IPv4 address, for tests and benchmarks.
    pub fn random() -> Contact {
        let ip: [u8; 4] = rand::random();
        let port = rand::random::<u16>().max(1);

        Contact {
            id: Id::random(),
            address: SocketAddr::from((ip, port)),
        }
    }
}
