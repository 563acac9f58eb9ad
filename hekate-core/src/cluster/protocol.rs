//! Gossip protocol messages and their wire codec.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::cluster::gossip::{GossipDigest, GossipEntry, GossipStatus};
use crate::codec::{Codec, CodecError, DataReader, DataWriter};
use crate::node::{Node, NodeId};

const TYPE_JOIN_REQUEST: u8 = 10;
const TYPE_JOIN_ACCEPT: u8 = 11;
const TYPE_JOIN_REJECT: u8 = 12;
const TYPE_UPDATE: u8 = 13;
const TYPE_LEAVE_REQUEST: u8 = 14;
const TYPE_LEAVE_ACK: u8 = 15;

/// Messages exchanged on the cluster connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// Joiner's first message to a seed node.
    JoinRequest {
        /// Full descriptor of the joining node.
        node: Node,
        /// Cluster the joiner believes it is joining.
        cluster: String,
    },
    /// Seed accepted the joiner and ships its current roster.
    JoinAccept {
        /// Accepting node's id (coordinator candidate).
        coordinator: NodeId,
        /// Cluster membership epoch at the accepting node.
        epoch: u64,
        /// Full roster snapshot.
        entries: Vec<GossipEntry>,
    },
    /// Validator chain refused the joiner.
    JoinReject {
        /// Reason produced by the failing validator.
        reason: String,
    },
    /// Periodic gossip exchange (also used as the reply with deltas).
    Update {
        /// Sender id.
        from: NodeId,
        /// Cluster membership epoch at the sender.
        epoch: u64,
        /// Compact summary of the sender's roster.
        digest: Vec<GossipDigest>,
        /// Entries the sender believes the recipient is missing.
        rumors: Vec<GossipEntry>,
    },
    /// Graceful-leave announcement awaiting acknowledgement.
    LeaveRequest {
        /// Leaving node id.
        from: NodeId,
        /// The leaving node's own roster entry (status `Leaving`).
        entry: GossipEntry,
    },
    /// Acknowledges a leave announcement.
    LeaveAck {
        /// Acknowledging node id.
        from: NodeId,
    },
}

/// Stateless codec for [`GossipMessage`].
pub struct GossipCodec;

impl Codec<GossipMessage> for GossipCodec {
    fn encode(&self, msg: &GossipMessage, out: &mut DataWriter) -> Result<(), CodecError> {
        match msg {
            GossipMessage::JoinRequest { node, cluster } => {
                out.write_u8(TYPE_JOIN_REQUEST);
                write_node(node, out);
                out.write_str(cluster);
            }
            GossipMessage::JoinAccept {
                coordinator,
                epoch,
                entries,
            } => {
                out.write_u8(TYPE_JOIN_ACCEPT);
                write_node_id(*coordinator, out);
                out.write_u64(*epoch);
                out.write_i32(entries.len() as i32);
                for entry in entries {
                    write_entry(entry, out);
                }
            }
            GossipMessage::JoinReject { reason } => {
                out.write_u8(TYPE_JOIN_REJECT);
                out.write_str(reason);
            }
            GossipMessage::Update {
                from,
                epoch,
                digest,
                rumors,
            } => {
                out.write_u8(TYPE_UPDATE);
                write_node_id(*from, out);
                out.write_u64(*epoch);
                out.write_i32(digest.len() as i32);
                for entry in digest {
                    write_node_id(entry.id, out);
                    out.write_u8(entry.status.to_wire());
                    out.write_u64(entry.version);
                }
                out.write_i32(rumors.len() as i32);
                for rumor in rumors {
                    write_entry(rumor, out);
                }
            }
            GossipMessage::LeaveRequest { from, entry } => {
                out.write_u8(TYPE_LEAVE_REQUEST);
                write_node_id(*from, out);
                write_entry(entry, out);
            }
            GossipMessage::LeaveAck { from } => {
                out.write_u8(TYPE_LEAVE_ACK);
                write_node_id(*from, out);
            }
        }
        Ok(())
    }

    fn decode(&self, input: &mut DataReader) -> Result<GossipMessage, CodecError> {
        match input.read_u8()? {
            TYPE_JOIN_REQUEST => {
                let node = read_node(input)?;
                let cluster = input.read_string()?;
                Ok(GossipMessage::JoinRequest { node, cluster })
            }
            TYPE_JOIN_ACCEPT => {
                let coordinator = read_node_id(input)?;
                let epoch = input.read_u64()?;
                let count = read_count(input)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(read_entry(input)?);
                }
                Ok(GossipMessage::JoinAccept {
                    coordinator,
                    epoch,
                    entries,
                })
            }
            TYPE_JOIN_REJECT => Ok(GossipMessage::JoinReject {
                reason: input.read_string()?,
            }),
            TYPE_UPDATE => {
                let from = read_node_id(input)?;
                let epoch = input.read_u64()?;
                let digest_count = read_count(input)?;
                let mut digest = Vec::with_capacity(digest_count);
                for _ in 0..digest_count {
                    let id = read_node_id(input)?;
                    let status = read_status(input)?;
                    let version = input.read_u64()?;
                    digest.push(GossipDigest {
                        id,
                        status,
                        version,
                    });
                }
                let rumor_count = read_count(input)?;
                let mut rumors = Vec::with_capacity(rumor_count);
                for _ in 0..rumor_count {
                    rumors.push(read_entry(input)?);
                }
                Ok(GossipMessage::Update {
                    from,
                    epoch,
                    digest,
                    rumors,
                })
            }
            TYPE_LEAVE_REQUEST => {
                let from = read_node_id(input)?;
                let entry = read_entry(input)?;
                Ok(GossipMessage::LeaveRequest { from, entry })
            }
            TYPE_LEAVE_ACK => Ok(GossipMessage::LeaveAck {
                from: read_node_id(input)?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

pub(crate) fn write_node_id(id: NodeId, out: &mut DataWriter) {
    out.write_u128(id.as_u128());
}

pub(crate) fn read_node_id(input: &mut DataReader) -> Result<NodeId, CodecError> {
    Ok(NodeId::from_u128(input.read_u128()?))
}

pub(crate) fn write_addr(addr: SocketAddr, out: &mut DataWriter) {
    out.write_str(&addr.to_string());
}

pub(crate) fn read_addr(input: &mut DataReader) -> Result<SocketAddr, CodecError> {
    let raw = input.read_string()?;
    raw.parse()
        .map_err(|_| CodecError::Malformed(format!("socket address '{raw}'")))
}

fn write_node(node: &Node, out: &mut DataWriter) {
    write_node_id(node.id, out);
    write_addr(node.addr, out);
    out.write_str(&node.name);
    out.write_i32(node.roles.len() as i32);
    for role in &node.roles {
        out.write_str(role);
    }
    out.write_i32(node.properties.len() as i32);
    for (key, value) in &node.properties {
        out.write_str(key);
        out.write_str(value);
    }
    out.write_u64(node.join_order);
}

fn read_node(input: &mut DataReader) -> Result<Node, CodecError> {
    let id = read_node_id(input)?;
    let addr = read_addr(input)?;
    let name = input.read_string()?;
    let role_count = read_count(input)?;
    let mut roles = BTreeSet::new();
    for _ in 0..role_count {
        roles.insert(input.read_string()?);
    }
    let property_count = read_count(input)?;
    let mut properties = BTreeMap::new();
    for _ in 0..property_count {
        let key = input.read_string()?;
        let value = input.read_string()?;
        properties.insert(key, value);
    }
    let join_order = input.read_u64()?;
    Ok(Node {
        id,
        addr,
        name,
        roles,
        properties,
        join_order,
    })
}

fn write_entry(entry: &GossipEntry, out: &mut DataWriter) {
    write_node(&entry.node, out);
    out.write_u8(entry.status.to_wire());
    out.write_u64(entry.version);
    out.write_i32(entry.suspicions.len() as i32);
    for suspecting in &entry.suspicions {
        write_node_id(*suspecting, out);
    }
}

fn read_entry(input: &mut DataReader) -> Result<GossipEntry, CodecError> {
    let node = read_node(input)?;
    let status = read_status(input)?;
    let version = input.read_u64()?;
    let suspicion_count = read_count(input)?;
    let mut suspicions = BTreeSet::new();
    for _ in 0..suspicion_count {
        suspicions.insert(read_node_id(input)?);
    }
    Ok(GossipEntry {
        node,
        status,
        version,
        suspicions,
    })
}

fn read_status(input: &mut DataReader) -> Result<GossipStatus, CodecError> {
    let raw = input.read_u8()?;
    GossipStatus::from_wire(raw).ok_or(CodecError::UnknownType(raw))
}

pub(crate) fn read_count(input: &mut DataReader) -> Result<usize, CodecError> {
    let count = input.read_i32()?;
    if count < 0 {
        return Err(CodecError::InvalidLength(count));
    }
    Ok(count as usize)
}
