use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use rand::Rng as _;

use super::error::DhtError;
use super::node::{decode_compact_nodes, encode_compact_nodes, Node, NodeId};
use crate::bencode::{decode, encode, DictBuilder, Value};

pub type TransactionId = Bytes;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

const COMPACT_PEER_LEN: usize = 6;

/// A short random transaction id for an outgoing query.
pub fn new_transaction_id() -> TransactionId {
    let mut tid = [0u8; 2];
    rand::rng().fill(&mut tid);
    Bytes::copy_from_slice(&tid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
    /// A method we do not implement. Answered with error 204.
    Unknown {
        method: String,
    },
}

impl DhtQuery {
    pub fn method(&self) -> &str {
        match self {
            DhtQuery::Ping => "ping",
            DhtQuery::FindNode { .. } => "find_node",
            DhtQuery::GetPeers { .. } => "get_peers",
            DhtQuery::AnnouncePeer { .. } => "announce_peer",
            DhtQuery::Unknown { method } => method,
        }
    }
}

/// A reply body. Replies carry no method name, so the kind is inferred from
/// the fields present: a token means `get_peers`, nodes alone mean
/// `find_node`, and a bare id answers both `ping` and `announce_peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtResponse {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<Node>,
    },
    GetPeers {
        id: NodeId,
        token: Bytes,
        nodes: Vec<Node>,
        values: Vec<SocketAddr>,
    },
}

impl DhtResponse {
    pub fn id(&self) -> &NodeId {
        match self {
            DhtResponse::Ping { id }
            | DhtResponse::FindNode { id, .. }
            | DhtResponse::GetPeers { id, .. } => id,
        }
    }

    /// Nodes the responder told us about, if any.
    pub fn nodes(&self) -> &[Node] {
        match self {
            DhtResponse::Ping { .. } => &[],
            DhtResponse::FindNode { nodes, .. } | DhtResponse::GetPeers { nodes, .. } => nodes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtMessage {
    Query {
        transaction_id: TransactionId,
        sender: NodeId,
        query: DhtQuery,
    },
    Response {
        transaction_id: TransactionId,
        response: DhtResponse,
    },
    Error {
        transaction_id: TransactionId,
        code: i64,
        message: String,
    },
}

impl DhtMessage {
    pub fn ping(transaction_id: TransactionId, our_id: &NodeId) -> Self {
        Self::query(transaction_id, our_id, DhtQuery::Ping)
    }

    pub fn find_node(transaction_id: TransactionId, our_id: &NodeId, target: NodeId) -> Self {
        Self::query(transaction_id, our_id, DhtQuery::FindNode { target })
    }

    pub fn get_peers(transaction_id: TransactionId, our_id: &NodeId, info_hash: [u8; 20]) -> Self {
        Self::query(transaction_id, our_id, DhtQuery::GetPeers { info_hash })
    }

    pub fn announce_peer(
        transaction_id: TransactionId,
        our_id: &NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
    ) -> Self {
        Self::query(
            transaction_id,
            our_id,
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                implied_port: false,
                token,
            },
        )
    }

    fn query(transaction_id: TransactionId, our_id: &NodeId, query: DhtQuery) -> Self {
        DhtMessage::Query {
            transaction_id,
            sender: *our_id,
            query,
        }
    }

    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        DhtMessage::Response {
            transaction_id,
            response,
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        DhtMessage::Error {
            transaction_id,
            code,
            message: message.into(),
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            DhtMessage::Query { transaction_id, .. }
            | DhtMessage::Response { transaction_id, .. }
            | DhtMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    /// The id the remote node claims, if the message carries one.
    pub fn sender(&self) -> Option<&NodeId> {
        match self {
            DhtMessage::Query { sender, .. } => Some(sender),
            DhtMessage::Response { response, .. } => Some(response.id()),
            DhtMessage::Error { .. } => None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        if value.as_dict().is_none() {
            return Err(DhtError::InvalidMessage("expected dict".into()));
        }

        let transaction_id = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let kind = value
            .get(b"y")
            .and_then(Value::as_str)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        match kind {
            "q" => parse_query(transaction_id, &value),
            "r" => parse_response(transaction_id, &value),
            "e" => parse_error(transaction_id, &value),
            other => Err(DhtError::InvalidMessage(format!(
                "unknown message type: {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let dict = match self {
            DhtMessage::Query {
                transaction_id,
                sender,
                query,
            } => DictBuilder::new()
                .put("t", transaction_id.clone())
                .put("y", "q")
                .put("q", query.method())
                .put("a", query_args(sender, query)),
            DhtMessage::Response {
                transaction_id,
                response,
            } => DictBuilder::new()
                .put("t", transaction_id.clone())
                .put("y", "r")
                .put("r", response_body(response)),
            DhtMessage::Error {
                transaction_id,
                code,
                message,
            } => DictBuilder::new()
                .put("t", transaction_id.clone())
                .put("y", "e")
                .put(
                    "e",
                    vec![Value::Integer(*code), Value::string(message)],
                ),
        };

        encode(&dict.build())
    }
}

fn query_args(sender: &NodeId, query: &DhtQuery) -> Value {
    let args = DictBuilder::new().raw("id", sender.as_bytes());
    let args = match query {
        DhtQuery::Ping | DhtQuery::Unknown { .. } => args,
        DhtQuery::FindNode { target } => args.raw("target", target.as_bytes()),
        DhtQuery::GetPeers { info_hash } => args.raw("info_hash", info_hash),
        DhtQuery::AnnouncePeer {
            info_hash,
            port,
            implied_port,
            token,
        } => args
            .raw("info_hash", info_hash)
            .int("port", i64::from(*port))
            .int("implied_port", i64::from(*implied_port))
            .put("token", token.clone()),
    };
    args.build()
}

fn response_body(response: &DhtResponse) -> Value {
    let body = DictBuilder::new().raw("id", response.id().as_bytes());
    let body = match response {
        DhtResponse::Ping { .. } => body,
        DhtResponse::FindNode { nodes, .. } => body.raw("nodes", &encode_compact_nodes(nodes)),
        DhtResponse::GetPeers {
            token,
            nodes,
            values,
            ..
        } => {
            let body = body.put("token", token.clone());
            let body = if nodes.is_empty() {
                body
            } else {
                body.raw("nodes", &encode_compact_nodes(nodes))
            };
            if values.is_empty() {
                body
            } else {
                body.put(
                    "values",
                    values
                        .iter()
                        .filter_map(encode_compact_peer)
                        .map(|p| Value::bytes(&p))
                        .collect::<Vec<_>>(),
                )
            }
        }
    };
    body.build()
}

fn parse_query(transaction_id: TransactionId, msg: &Value) -> Result<DhtMessage, DhtError> {
    let method = msg
        .get(b"q")
        .and_then(Value::as_str)
        .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;

    let args = msg
        .get(b"a")
        .filter(|a| a.as_dict().is_some())
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let sender = args
        .get_20(b"id")
        .map(NodeId)
        .ok_or_else(|| DhtError::InvalidMessage("missing sender id".into()))?;

    let info_hash = || {
        args.get_20(b"info_hash")
            .ok_or_else(|| DhtError::InvalidMessage("missing info_hash".into()))
    };

    let query = match method {
        "ping" => DhtQuery::Ping,
        "find_node" => DhtQuery::FindNode {
            target: args
                .get_20(b"target")
                .map(NodeId)
                .ok_or_else(|| DhtError::InvalidMessage("missing target".into()))?,
        },
        "get_peers" => DhtQuery::GetPeers {
            info_hash: info_hash()?,
        },
        "announce_peer" => {
            let port = args
                .get(b"port")
                .and_then(Value::as_integer)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| DhtError::InvalidMessage("missing or invalid port".into()))?;

            DhtQuery::AnnouncePeer {
                info_hash: info_hash()?,
                port,
                implied_port: args
                    .get(b"implied_port")
                    .and_then(Value::as_integer)
                    .is_some_and(|v| v != 0),
                token: args
                    .get(b"token")
                    .and_then(Value::as_bytes)
                    .cloned()
                    .unwrap_or_default(),
            }
        }
        other => DhtQuery::Unknown {
            method: other.to_string(),
        },
    };

    Ok(DhtMessage::Query {
        transaction_id,
        sender,
        query,
    })
}

fn parse_response(transaction_id: TransactionId, msg: &Value) -> Result<DhtMessage, DhtError> {
    let body = msg
        .get(b"r")
        .filter(|r| r.as_dict().is_some())
        .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

    let id = body
        .get_20(b"id")
        .map(NodeId)
        .ok_or_else(|| DhtError::InvalidMessage("missing id in response".into()))?;

    let nodes = match body.get(b"nodes").and_then(Value::as_bytes) {
        Some(data) => Some(decode_compact_nodes(data)?),
        None => None,
    };

    let token = body.get(b"token").and_then(Value::as_bytes).cloned();

    let response = match (token, nodes) {
        (Some(token), nodes) => DhtResponse::GetPeers {
            id,
            token,
            nodes: nodes.unwrap_or_default(),
            values: body
                .get(b"values")
                .and_then(Value::as_list)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_bytes)
                        .filter_map(|b| decode_compact_peer(b))
                        .collect()
                })
                .unwrap_or_default(),
        },
        (None, Some(nodes)) => DhtResponse::FindNode { id, nodes },
        (None, None) => DhtResponse::Ping { id },
    };

    Ok(DhtMessage::Response {
        transaction_id,
        response,
    })
}

fn parse_error(transaction_id: TransactionId, msg: &Value) -> Result<DhtMessage, DhtError> {
    let error = msg
        .get(b"e")
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    let code = error
        .first()
        .and_then(Value::as_integer)
        .unwrap_or(ERROR_GENERIC);
    let message = error
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    Ok(DhtMessage::Error {
        transaction_id,
        code,
        message,
    })
}

/// 4-byte IPv4 address followed by a big-endian port.
pub fn decode_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn encode_compact_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    let SocketAddr::V4(v4) = addr else {
        return None;
    };
    let mut data = [0u8; COMPACT_PEER_LEN];
    data[..4].copy_from_slice(&v4.ip().octets());
    data[4..].copy_from_slice(&v4.port().to_be_bytes());
    Some(data)
}
