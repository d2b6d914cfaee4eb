//! Answering inbound requests.

pub mod tokens;

use std::net::SocketAddr;

use tracing::debug;

use crate::common::{
    Contact, ErrorSpecific, FindNodeResponseArguments, GetPeersResponseArguments, Id, MessageType,
    PingResponseArguments, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    MAX_BUCKET_SIZE_K, PROTOCOL_ERROR,
};
use crate::routing::RoutingTable;

use tokens::{TokenService, Tokens};

/// Dht server that can handle incoming rpc requests
pub trait Server: std::fmt::Debug + Send + Sync {
    /// Handle an incoming request, returning the [MessageType::Response] or
    /// [MessageType::Error] to send back to the requester.
    ///
    /// Runs on the socket thread, so it needs to be fast and lightweight.
    fn handle_request(
        &mut self,
        local_id: &Id,
        routing_table: &RoutingTable,
        from: SocketAddr,
        request: RequestSpecific,
    ) -> MessageType;
}

#[derive(Debug)]
/// Default implementation of [Server] trait.
///
/// Answers the [BEP0005](https://www.bittorrent.org/beps/bep_0005.html)
/// queries from the routing table. Announced peers are acknowledged but not
/// stored.
pub struct DefaultServer {
    /// Tokens generator
    pub tokens: Box<dyn TokenService>,
}

impl Default for DefaultServer {
    fn default() -> Self {
        DefaultServer {
            tokens: Box::new(Tokens::new()),
        }
    }
}

impl DefaultServer {
    pub fn new(tokens: Box<dyn TokenService>) -> Self {
        DefaultServer { tokens }
    }
}

impl Server for DefaultServer {
    fn handle_request(
        &mut self,
        local_id: &Id,
        routing_table: &RoutingTable,
        from: SocketAddr,
        request: RequestSpecific,
    ) -> MessageType {
        let responder_id = *local_id;

        match request.request_type {
            RequestTypeSpecific::Ping => {
                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id,
                }))
            }
            RequestTypeSpecific::FindNode(arguments) => {
                let closest = routing_table.closest(&arguments.target, MAX_BUCKET_SIZE_K);
                let (nodes, nodes6): (Vec<Contact>, Vec<Contact>) =
                    closest.nodes().iter().partition(|c| c.address.is_ipv4());

                MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id,
                    nodes,
                    nodes6,
                }))
            }
            RequestTypeSpecific::GetPeers(arguments) => {
                let closest = routing_table.closest(&arguments.info_hash, MAX_BUCKET_SIZE_K);
                let (nodes, nodes6): (Vec<Contact>, Vec<Contact>) =
                    closest.nodes().iter().partition(|c| c.address.is_ipv4());

                MessageType::Response(ResponseSpecific::GetPeers(GetPeersResponseArguments {
                    responder_id,
                    token: self.tokens.gen_token(from),
                    values: vec![],
                    nodes,
                    nodes6,
                }))
            }
            RequestTypeSpecific::AnnouncePeer(arguments) => {
                if !self.tokens.check_token(from, &arguments.token) {
                    debug!(
                        context = "server_invalid_token",
                        info_hash = %arguments.info_hash,
                        ?from,
                        "Invalid token"
                    );

                    return MessageType::Error(ErrorSpecific {
                        code: PROTOCOL_ERROR,
                        description: "Bad token".to_string(),
                    });
                }

                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id,
                }))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{
        AnnouncePeerRequestArguments, FindNodeRequestArguments, GetPeersRequestArguments,
    };
    use crate::routing::{InsertOptions, KBucketEntry, Node};

    fn request(request_type: RequestTypeSpecific) -> RequestSpecific {
        RequestSpecific {
            requester_id: Id::random(),
            request_type,
        }
    }

    fn node_with_entries() -> Node {
        let node = Node::new(Id::random());

        for i in 0..50_u32 {
            let address = SocketAddr::from(((0x0a00_0000 + i).to_be_bytes(), 6881));
            let mut entry = KBucketEntry::new(Id::random(), address);
            entry.signal_response(None);
            node.insert_entry(entry, InsertOptions::default());
        }

        node
    }

    #[test]
    fn find_node_returns_closest() {
        let node = node_with_entries();
        let mut server = DefaultServer::default();
        let target = Id::random();
        let from = SocketAddr::from(([127, 0, 0, 1], 6881));

        let response = server.handle_request(
            node.id(),
            &node.table(),
            from,
            request(RequestTypeSpecific::FindNode(FindNodeRequestArguments { target })),
        );

        let MessageType::Response(ResponseSpecific::FindNode(arguments)) = response else {
            panic!("expected find_node response");
        };

        assert_eq!(arguments.responder_id, *node.id());
        assert_eq!(arguments.nodes.len(), MAX_BUCKET_SIZE_K);
        assert_eq!(
            arguments.nodes,
            node.table().closest(&target, MAX_BUCKET_SIZE_K).nodes()
        );
    }

    #[test]
    fn announce_needs_a_valid_token() {
        let node = node_with_entries();
        let mut server = DefaultServer::default();
        let info_hash = Id::random();
        let from = SocketAddr::from(([127, 0, 0, 1], 6881));

        let response = server.handle_request(
            node.id(),
            &node.table(),
            from,
            request(RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash })),
        );
        let MessageType::Response(ResponseSpecific::GetPeers(arguments)) = response else {
            panic!("expected get_peers response");
        };

        let announce = |token: Vec<u8>| {
            request(RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                info_hash,
                port: 6881,
                implied_port: None,
                token,
            }))
        };

        let accepted =
            server.handle_request(node.id(), &node.table(), from, announce(arguments.token));
        assert!(matches!(accepted, MessageType::Response(_)));

        let rejected = server.handle_request(node.id(), &node.table(), from, announce(vec![0; 4]));
        assert!(matches!(
            rejected,
            MessageType::Error(ErrorSpecific {
                code: PROTOCOL_ERROR,
                ..
            })
        ));
    }
}
