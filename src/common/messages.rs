//! Serialize and deserialize KRPC messages.

mod internal;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::{Contact, Id, ID_SIZE};
use crate::{Error, Result};

/// Length of the transaction ids this crate generates.
pub const TRANSACTION_ID_SIZE: usize = 6;

/// A bug or an unexpected condition on our side.
pub const GENERIC_ERROR: i32 = 201;
/// Unknown or expired transaction id.
pub const SERVER_ERROR: i32 = 202;
/// Malformed packet.
pub const PROTOCOL_ERROR: i32 = 203;
pub const METHOD_UNKNOWN: i32 = 204;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Opaque bytes echoed back by the responder.
    pub transaction_id: Vec<u8>,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    /// The IP address and port ("SocketAddr") of the requester as seen from the responder's point of view.
    /// Only set on responses.
    pub requester_ip: Option<SocketAddr>,

    pub message_type: MessageType,

    /// For bep0043. When set true on a request, indicates that the requester can't reply to requests and that responders should not add requester to their routing tables.
    pub read_only: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetPeers(GetPeersRequestArguments),
    AnnouncePeer(AnnouncePeerRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
    GetPeers(GetPeersResponseArguments),
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Contact>,
    pub nodes6: Vec<Contact>,
}

// === Get Peers ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersResponseArguments {
    pub responder_id: Id,
    pub token: Vec<u8>,
    pub values: Vec<SocketAddr>,
    pub nodes: Vec<Contact>,
    pub nodes6: Vec<Contact>,
}

// === Announce Peer ===

#[derive(Debug, PartialEq, Clone)]
pub struct AnnouncePeerRequestArguments {
    pub info_hash: Id,
    pub port: u16,
    pub implied_port: Option<bool>,
    pub token: Vec<u8>,
}

impl Message {
    /// An error message answering `transaction_id`.
    pub fn error(transaction_id: Vec<u8>, code: i32, description: impl Into<String>) -> Message {
        Message {
            transaction_id,
            version: None,
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Error(ErrorSpecific {
                code,
                description: description.into(),
            }),
        }
    }

    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id,
            version: self.version,
            ip: self
                .requester_ip
                .map(|sockaddr| sockaddr_to_bytes(&sockaddr)),
            read_only: if self.read_only { Some(1) } else { None },
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    request_type,
                }) => internal::DHTMessageVariant::Request(match request_type {
                    RequestTypeSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingArguments {
                            id: requester_id.to_vec(),
                        },
                    },
                    RequestTypeSpecific::FindNode(find_node_args) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: requester_id.to_vec(),
                                target: find_node_args.target.to_vec(),
                            },
                        }
                    }
                    RequestTypeSpecific::GetPeers(get_peers_args) => {
                        internal::DHTRequestSpecific::GetPeers {
                            arguments: internal::DHTGetPeersRequestArguments {
                                id: requester_id.to_vec(),
                                info_hash: get_peers_args.info_hash.to_vec(),
                            },
                        }
                    }
                    RequestTypeSpecific::AnnouncePeer(announce_peer_args) => {
                        internal::DHTRequestSpecific::AnnouncePeer {
                            arguments: internal::DHTAnnouncePeerRequestArguments {
                                id: requester_id.to_vec(),
                                token: announce_peer_args.token,
                                info_hash: announce_peer_args.info_hash.to_vec(),
                                port: announce_peer_args.port,
                                implied_port: announce_peer_args
                                    .implied_port
                                    .map(|implied| implied as u8),
                            },
                        }
                    }
                }),

                MessageType::Response(res) => {
                    internal::DHTMessageVariant::Response(internal::DHTResponse {
                        arguments: match res {
                            ResponseSpecific::Ping(ping_args) => internal::DHTResponseArguments {
                                id: ping_args.responder_id.to_vec(),
                                ..Default::default()
                            },
                            ResponseSpecific::FindNode(find_node_args) => {
                                internal::DHTResponseArguments {
                                    id: find_node_args.responder_id.to_vec(),
                                    nodes: non_empty(nodes_to_bytes(&find_node_args.nodes, false)),
                                    nodes6: non_empty(nodes_to_bytes(&find_node_args.nodes6, true)),
                                    ..Default::default()
                                }
                            }
                            ResponseSpecific::GetPeers(get_peers_args) => {
                                internal::DHTResponseArguments {
                                    id: get_peers_args.responder_id.to_vec(),
                                    token: Some(get_peers_args.token),
                                    nodes: non_empty(nodes_to_bytes(&get_peers_args.nodes, false)),
                                    nodes6: non_empty(nodes_to_bytes(&get_peers_args.nodes6, true)),
                                    values: if get_peers_args.values.is_empty() {
                                        None
                                    } else {
                                        Some(peers_to_bytes(&get_peers_args.values))
                                    },
                                }
                            }
                        },
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: vec![
                            serde_bencode::value::Value::Int(err.code.into()),
                            serde_bencode::value::Value::Bytes(err.description.into()),
                        ],
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        Ok(Message {
            transaction_id: msg.transaction_id,
            version: msg.version,
            requester_ip: match msg.ip {
                Some(ip) => Some(bytes_to_sockaddr(ip)?),
                _ => None,
            },
            read_only: msg.read_only.map(|ro| ro > 0).unwrap_or(false),
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DHTRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::DHTRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                            }),
                        },
                        internal::DHTRequestSpecific::GetPeers { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                                info_hash: Id::from_bytes(arguments.info_hash)?,
                            }),
                        },
                        internal::DHTRequestSpecific::AnnouncePeer { arguments } => {
                            RequestSpecific {
                                requester_id: Id::from_bytes(arguments.id)?,
                                request_type: RequestTypeSpecific::AnnouncePeer(
                                    AnnouncePeerRequestArguments {
                                        implied_port: arguments
                                            .implied_port
                                            .map(|implied_port| implied_port != 0),
                                        info_hash: Id::from_bytes(&arguments.info_hash)?,
                                        port: arguments.port,
                                        token: arguments.token,
                                    },
                                ),
                            }
                        }
                    })
                }

                internal::DHTMessageVariant::Response(internal::DHTResponse { arguments }) => {
                    let responder_id = Id::from_bytes(&arguments.id)?;
                    let nodes = match arguments.nodes {
                        Some(nodes) => bytes_to_nodes(nodes, false)?,
                        None => vec![],
                    };
                    let nodes6 = match arguments.nodes6 {
                        Some(nodes6) => bytes_to_nodes(nodes6, true)?,
                        None => vec![],
                    };

                    MessageType::Response(match (arguments.token, arguments.values) {
                        (Some(token), values) => {
                            ResponseSpecific::GetPeers(GetPeersResponseArguments {
                                responder_id,
                                token,
                                values: match values {
                                    Some(values) => bytes_to_peers(values)?,
                                    None => vec![],
                                },
                                nodes,
                                nodes6,
                            })
                        }
                        (None, _) if nodes.is_empty() && nodes6.is_empty() => {
                            ResponseSpecific::Ping(PingResponseArguments { responder_id })
                        }
                        (None, _) => ResponseSpecific::FindNode(FindNodeResponseArguments {
                            responder_id,
                            nodes,
                            nodes6,
                        }),
                    })
                }

                internal::DHTMessageVariant::Error(err) => {
                    if err.error_info.len() < 2 {
                        return Err(Error::Static(
                            "Error packet should have at least 2 elements",
                        ));
                    }
                    MessageType::Error(ErrorSpecific {
                        code: match err.error_info[0] {
                            serde_bencode::value::Value::Int(code) => match code.try_into() {
                                Ok(code) => code,
                                Err(_) => return Err(Error::Static("error parsing error code")),
                            },
                            _ => return Err(Error::Static("Expected error code as first element")),
                        },
                        description: match &err.error_info[1] {
                            serde_bencode::value::Value::Bytes(desc) => {
                                String::from_utf8_lossy(desc).to_string()
                            }
                            _ => {
                                return Err(Error::Static("Expected description as second element"))
                            }
                        },
                    })
                }
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes)?)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.message_type, MessageType::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.message_type, MessageType::Response(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.message_type, MessageType::Error(_))
    }

    /// Return the Id of the sender of the Message.
    ///
    /// Every message carries one except errors.
    pub fn author_id(&self) -> Option<Id> {
        let id = match &self.message_type {
            MessageType::Request(arguments) => arguments.requester_id,
            MessageType::Response(response_variant) => match response_variant {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
                ResponseSpecific::GetPeers(arguments) => arguments.responder_id,
            },
            MessageType::Error(_) => {
                return None;
            }
        };

        Some(id)
    }

    /// Contacts advertised in a `find_node` or `get_peers` response, both families.
    pub fn closer_nodes(&self) -> Vec<Contact> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::FindNode(arguments)) => arguments
                .nodes
                .iter()
                .chain(arguments.nodes6.iter())
                .copied()
                .collect(),
            MessageType::Response(ResponseSpecific::GetPeers(arguments)) => arguments
                .nodes
                .iter()
                .chain(arguments.nodes6.iter())
                .copied()
                .collect(),
            _ => vec![],
        }
    }

    pub fn token(&self) -> Option<(Id, Vec<u8>)> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::GetPeers(arguments)) => {
                Some((arguments.responder_id, arguments.token.clone()))
            }
            _ => None,
        }
    }
}

fn non_empty(bytes: Vec<u8>) -> Option<Vec<u8>> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

/// Parse a compact address: 4 or 16 bytes of ip followed by a big endian port.
pub fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);

            let port_bytes_as_array: [u8; 2] = bytes[4..6]
                .try_into()
                .map_err(|_| Error::Static("wrong number of bytes for port"))?;

            let port: u16 = u16::from_be_bytes(port_bytes_as_array);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let ip_bytes: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| Error::Static("wrong number of bytes for ipv6"))?;
            let port_bytes_as_array: [u8; 2] = bytes[16..18]
                .try_into()
                .map_err(|_| Error::Static("wrong number of bytes for port"))?;

            Ok(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(ip_bytes)),
                u16::from_be_bytes(port_bytes_as_array),
            ))
        }
        _ => Err(Error::Static("Wrong number of bytes for sockaddr")),
    }
}

/// Compact address encoding, 6 bytes for IPv4 and 18 for IPv6.
pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr.ip() {
        IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
    }

    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

/// Encode contacts of one address family, contacts of the other family are skipped.
fn nodes_to_bytes(nodes: &[Contact], v6: bool) -> Vec<u8> {
    let node_byte_size: usize = ID_SIZE + if v6 { 18 } else { 6 };
    let mut vec = Vec::with_capacity(node_byte_size * nodes.len());

    for node in nodes.iter().filter(|n| n.address.is_ipv6() == v6) {
        vec.extend_from_slice(node.id.as_bytes());
        vec.append(&mut sockaddr_to_bytes(&node.address));
    }

    vec
}

fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T, v6: bool) -> Result<Vec<Contact>> {
    let bytes = bytes.as_ref();
    let node_byte_size: usize = ID_SIZE + if v6 { 18 } else { 6 };

    if bytes.len() % node_byte_size != 0 {
        return Err(Error::Generic(format!(
            "Wrong number of bytes for nodes message ({})",
            bytes.len()
        )));
    }

    bytes
        .chunks_exact(node_byte_size)
        .map(|chunk| {
            Ok(Contact::new(
                Id::from_bytes(&chunk[..ID_SIZE])?,
                bytes_to_sockaddr(&chunk[ID_SIZE..])?,
            ))
        })
        .collect()
}

fn peers_to_bytes(peers: &[SocketAddr]) -> Vec<serde_bytes::ByteBuf> {
    peers
        .iter()
        .map(|p| serde_bytes::ByteBuf::from(sockaddr_to_bytes(p)))
        .collect()
}

fn bytes_to_peers<T: AsRef<[serde_bytes::ByteBuf]>>(bytes: T) -> Result<Vec<SocketAddr>> {
    let bytes = bytes.as_ref();
    bytes.iter().map(bytes_to_sockaddr).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &Message) -> Message {
        Message::from_bytes(message.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn ping_request() {
        let original_msg = Message {
            transaction_id: vec![1, 2, 3, 4, 5, 6],
            version: None,
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            }),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn ping_response_with_requester_ip() {
        let original_msg = Message {
            transaction_id: vec![9; 6],
            version: Some(vec![0xde, 0xad]),
            requester_ip: Some("99.100.101.102:1030".parse().unwrap()),
            read_only: false,
            message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: Id::random(),
            })),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn find_node_response_with_both_families() {
        let original_msg = Message {
            transaction_id: vec![0, 1],
            version: Some(vec![1]),
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![Contact::new(Id::random(), "49.50.52.52:5354".parse().unwrap())],
                    nodes6: vec![Contact::new(Id::random(), "[2001:db8::1]:6881".parse().unwrap())],
                },
            )),
        };

        let parsed = round_trip(&original_msg);

        assert_eq!(parsed, original_msg);
        assert_eq!(parsed.closer_nodes().len(), 2);
    }

    #[test]
    fn get_peers_response() {
        let original_msg = Message {
            transaction_id: vec![3],
            version: None,
            requester_ip: None,
            read_only: true,
            message_type: MessageType::Response(ResponseSpecific::GetPeers(
                GetPeersResponseArguments {
                    responder_id: Id::random(),
                    token: vec![99, 100, 101, 102],
                    values: vec!["1.2.3.4:80".parse().unwrap()],
                    nodes: vec![Contact::new(Id::random(), "49.50.52.52:5354".parse().unwrap())],
                    nodes6: vec![],
                },
            )),
        };

        let parsed = round_trip(&original_msg);

        assert_eq!(parsed, original_msg);
        assert_eq!(parsed.token().map(|(_, t)| t), Some(vec![99, 100, 101, 102]));
    }

    #[test]
    fn announce_peer_request() {
        let original_msg = Message {
            transaction_id: vec![7; 6],
            version: None,
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                    info_hash: Id::random(),
                    port: 6881,
                    implied_port: Some(true),
                    token: vec![1, 2, 3, 4],
                }),
            }),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn error_message() {
        let original_msg = Message::error(vec![0; 6], PROTOCOL_ERROR, "invalid bencoding");

        let parsed = round_trip(&original_msg);

        assert_eq!(parsed, original_msg);
        assert_eq!(parsed.author_id(), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Message::from_bytes(b"not bencode").is_err());
        assert!(Message::from_bytes(b"d1:t2:aa1:y1:qe").is_err());
    }

    #[test]
    fn rejects_short_ids() {
        // ping with a 4 byte id
        let bytes = b"d1:ad2:id4:abcde1:q4:ping1:t2:aa1:y1:qe";

        assert!(matches!(
            Message::from_bytes(bytes),
            Err(Error::InvalidIdSize(4))
        ));
    }
}
