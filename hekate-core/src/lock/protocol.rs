//! Lock protocol messages and their wire codec.

use std::collections::BTreeMap;

use crate::cluster::TopologyHash;
use crate::cluster::protocol::{read_count, read_node_id, write_node_id};
use crate::codec::{Codec, CodecError, DataReader, DataWriter};
use crate::node::NodeId;

const TYPE_LOCK_REQUEST: u8 = 30;
const TYPE_LOCK_RESPONSE: u8 = 31;
const TYPE_UNLOCK_REQUEST: u8 = 32;
const TYPE_UNLOCK_RESPONSE: u8 = 33;
const TYPE_OWNER_REQUEST: u8 = 34;
const TYPE_OWNER_RESPONSE: u8 = 35;
const TYPE_MIGRATION_PREPARE: u8 = 36;
const TYPE_MIGRATION_APPLY: u8 = 37;
const TYPE_MIGRATION_RESPONSE: u8 = 38;

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Acquired.
    Ok,
    /// Held by someone else (immediate attempts only).
    Busy,
    /// Wait budget expired at the manager.
    Timeout,
    /// Manager topology is stale; refresh and retry.
    Retry,
}

impl LockStatus {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Busy => 1,
            Self::Timeout => 2,
            Self::Retry => 3,
        }
    }

    const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Busy),
            2 => Some(Self::Timeout),
            3 => Some(Self::Retry),
            _ => None,
        }
    }
}

/// Outcome of an unlock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    /// Released (stale unlocks of unheld locks also report this).
    Ok,
    /// Held by a different owner.
    NotOwner,
    /// Manager topology is stale; refresh and retry.
    Retry,
}

impl UnlockStatus {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::NotOwner => 1,
            Self::Retry => 2,
        }
    }

    const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::NotOwner),
            2 => Some(Self::Retry),
            _ => None,
        }
    }
}

/// Outcome of an owner query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerStatus {
    /// Response is authoritative.
    Ok,
    /// Manager topology is stale; refresh and retry.
    Retry,
}

impl OwnerStatus {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Retry => 1,
        }
    }

    const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Retry),
            _ => None,
        }
    }
}

/// Outcome of a migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Step applied.
    Ok,
    /// Key is stale or the recipient's topology diverged.
    Retry,
}

impl MigrationStatus {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Retry => 1,
        }
    }

    const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Retry),
            _ => None,
        }
    }
}

/// Identifies one lock-rebalancing round; stale keys are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMigrationKey {
    /// Coordinator that initiated the round.
    pub node: NodeId,
    /// Region topology hash the round is based on.
    pub topology: TopologyHash,
    /// Monotonic round id at the coordinator.
    pub id: u64,
}

/// One lock ownership record shipped during migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMigrationInfo {
    /// Lock name.
    pub name: String,
    /// Acquisition id at the owner.
    pub lock_id: u64,
    /// Owner's acquirer token.
    pub thread_id: u64,
    /// Owning node.
    pub node: NodeId,
}

/// Messages of the lock protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProtocol {
    /// Acquire attempt; `timeout_ms < 0` waits without bound.
    LockRequest {
        /// Client-side acquisition id.
        lock_id: u64,
        /// Region name.
        region: String,
        /// Lock name.
        name: String,
        /// Wait budget in milliseconds; negative waits forever, zero is
        /// an immediate attempt.
        timeout_ms: i64,
        /// Whether the requester wants owner feedback on failures.
        with_feedback: bool,
        /// Requester's acquirer token.
        thread_id: u64,
        /// Requester's region topology hash.
        topology: TopologyHash,
        /// Requesting node.
        node: NodeId,
    },
    /// Reply to [`LockProtocol::LockRequest`].
    LockResponse {
        /// Outcome.
        status: LockStatus,
        /// Owner's acquirer token (when reported).
        owner_thread: u64,
        /// Current owner (when reported).
        owner: Option<NodeId>,
    },
    /// Release attempt.
    UnlockRequest {
        /// Acquisition id being released.
        lock_id: u64,
        /// Region name.
        region: String,
        /// Lock name.
        name: String,
        /// Requester's region topology hash.
        topology: TopologyHash,
        /// Requesting node.
        node: NodeId,
    },
    /// Reply to [`LockProtocol::UnlockRequest`].
    UnlockResponse {
        /// Outcome.
        status: UnlockStatus,
    },
    /// Owner query.
    OwnerRequest {
        /// Region name.
        region: String,
        /// Lock name.
        name: String,
        /// Requester's region topology hash.
        topology: TopologyHash,
    },
    /// Reply to [`LockProtocol::OwnerRequest`].
    OwnerResponse {
        /// Owner's acquirer token (zero when unowned).
        thread_id: u64,
        /// Current owner, if any.
        owner: Option<NodeId>,
        /// Outcome.
        status: OwnerStatus,
    },
    /// First migration phase: collect ownership state across the region.
    MigrationPrepare {
        /// Region name.
        region: String,
        /// Round identifier.
        key: LockMigrationKey,
        /// Whether this is the first collection pass.
        first_pass: bool,
        /// Region topology hash reported by each visited node.
        topologies: BTreeMap<NodeId, Option<TopologyHash>>,
        /// Ownership records accumulated so far.
        locks: Vec<LockMigrationInfo>,
    },
    /// Second migration phase: adopt the merged ownership set.
    MigrationApply {
        /// Region name.
        region: String,
        /// Round identifier.
        key: LockMigrationKey,
        /// Merged ownership records.
        locks: Vec<LockMigrationInfo>,
    },
    /// Reply to migration steps.
    MigrationResponse {
        /// Outcome.
        status: MigrationStatus,
    },
}

fn write_topology_hash(hash: &TopologyHash, out: &mut DataWriter) {
    for byte in hash.as_bytes() {
        out.write_u8(*byte);
    }
}

fn read_topology_hash(input: &mut DataReader) -> Result<TopologyHash, CodecError> {
    let mut bytes = [0u8; 16];
    for byte in &mut bytes {
        *byte = input.read_u8()?;
    }
    Ok(TopologyHash::from_bytes(bytes))
}

fn write_optional_node(node: Option<NodeId>, out: &mut DataWriter) {
    match node {
        Some(node) => {
            out.write_bool(true);
            write_node_id(node, out);
        }
        None => out.write_bool(false),
    }
}

fn read_optional_node(input: &mut DataReader) -> Result<Option<NodeId>, CodecError> {
    if input.read_bool()? {
        Ok(Some(read_node_id(input)?))
    } else {
        Ok(None)
    }
}

fn write_key(key: &LockMigrationKey, out: &mut DataWriter) {
    write_node_id(key.node, out);
    write_topology_hash(&key.topology, out);
    out.write_u64(key.id);
}

fn read_key(input: &mut DataReader) -> Result<LockMigrationKey, CodecError> {
    let node = read_node_id(input)?;
    let topology = read_topology_hash(input)?;
    let id = input.read_u64()?;
    Ok(LockMigrationKey { node, topology, id })
}

fn write_locks(locks: &[LockMigrationInfo], out: &mut DataWriter) {
    out.write_i32(locks.len() as i32);
    for lock in locks {
        out.write_str(&lock.name);
        out.write_u64(lock.lock_id);
        out.write_u64(lock.thread_id);
        write_node_id(lock.node, out);
    }
}

fn read_locks(input: &mut DataReader) -> Result<Vec<LockMigrationInfo>, CodecError> {
    let count = read_count(input)?;
    let mut locks = Vec::with_capacity(count);
    for _ in 0..count {
        let name = input.read_string()?;
        let lock_id = input.read_u64()?;
        let thread_id = input.read_u64()?;
        let node = read_node_id(input)?;
        locks.push(LockMigrationInfo {
            name,
            lock_id,
            thread_id,
            node,
        });
    }
    Ok(locks)
}

/// Stateless codec for [`LockProtocol`].
pub struct LockProtocolCodec;

impl Codec<LockProtocol> for LockProtocolCodec {
    fn encode(&self, msg: &LockProtocol, out: &mut DataWriter) -> Result<(), CodecError> {
        match msg {
            LockProtocol::LockRequest {
                lock_id,
                region,
                name,
                timeout_ms,
                with_feedback,
                thread_id,
                topology,
                node,
            } => {
                out.write_u8(TYPE_LOCK_REQUEST);
                out.write_u64(*lock_id);
                out.write_str(region);
                out.write_str(name);
                out.write_i64(*timeout_ms);
                out.write_bool(*with_feedback);
                out.write_u64(*thread_id);
                write_topology_hash(topology, out);
                write_node_id(*node, out);
            }
            LockProtocol::LockResponse {
                status,
                owner_thread,
                owner,
            } => {
                out.write_u8(TYPE_LOCK_RESPONSE);
                out.write_u8(status.to_wire());
                out.write_u64(*owner_thread);
                write_optional_node(*owner, out);
            }
            LockProtocol::UnlockRequest {
                lock_id,
                region,
                name,
                topology,
                node,
            } => {
                out.write_u8(TYPE_UNLOCK_REQUEST);
                out.write_u64(*lock_id);
                out.write_str(region);
                out.write_str(name);
                write_topology_hash(topology, out);
                write_node_id(*node, out);
            }
            LockProtocol::UnlockResponse { status } => {
                out.write_u8(TYPE_UNLOCK_RESPONSE);
                out.write_u8(status.to_wire());
            }
            LockProtocol::OwnerRequest {
                region,
                name,
                topology,
            } => {
                out.write_u8(TYPE_OWNER_REQUEST);
                out.write_str(region);
                out.write_str(name);
                write_topology_hash(topology, out);
            }
            LockProtocol::OwnerResponse {
                thread_id,
                owner,
                status,
            } => {
                out.write_u8(TYPE_OWNER_RESPONSE);
                out.write_u64(*thread_id);
                write_optional_node(*owner, out);
                out.write_u8(status.to_wire());
            }
            LockProtocol::MigrationPrepare {
                region,
                key,
                first_pass,
                topologies,
                locks,
            } => {
                out.write_u8(TYPE_MIGRATION_PREPARE);
                out.write_str(region);
                write_key(key, out);
                out.write_bool(*first_pass);
                out.write_i32(topologies.len() as i32);
                for (node, hash) in topologies {
                    write_node_id(*node, out);
                    match hash {
                        Some(hash) => {
                            out.write_bool(true);
                            write_topology_hash(hash, out);
                        }
                        None => out.write_bool(false),
                    }
                }
                write_locks(locks, out);
            }
            LockProtocol::MigrationApply { region, key, locks } => {
                out.write_u8(TYPE_MIGRATION_APPLY);
                out.write_str(region);
                write_key(key, out);
                write_locks(locks, out);
            }
            LockProtocol::MigrationResponse { status } => {
                out.write_u8(TYPE_MIGRATION_RESPONSE);
                out.write_u8(status.to_wire());
            }
        }
        Ok(())
    }

    fn decode(&self, input: &mut DataReader) -> Result<LockProtocol, CodecError> {
        match input.read_u8()? {
            TYPE_LOCK_REQUEST => {
                let lock_id = input.read_u64()?;
                let region = input.read_string()?;
                let name = input.read_string()?;
                let timeout_ms = input.read_i64()?;
                let with_feedback = input.read_bool()?;
                let thread_id = input.read_u64()?;
                let topology = read_topology_hash(input)?;
                let node = read_node_id(input)?;
                Ok(LockProtocol::LockRequest {
                    lock_id,
                    region,
                    name,
                    timeout_ms,
                    with_feedback,
                    thread_id,
                    topology,
                    node,
                })
            }
            TYPE_LOCK_RESPONSE => {
                let status = input.read_u8()?;
                let status = LockStatus::from_wire(status)
                    .ok_or(CodecError::UnknownType(status))?;
                let owner_thread = input.read_u64()?;
                let owner = read_optional_node(input)?;
                Ok(LockProtocol::LockResponse {
                    status,
                    owner_thread,
                    owner,
                })
            }
            TYPE_UNLOCK_REQUEST => {
                let lock_id = input.read_u64()?;
                let region = input.read_string()?;
                let name = input.read_string()?;
                let topology = read_topology_hash(input)?;
                let node = read_node_id(input)?;
                Ok(LockProtocol::UnlockRequest {
                    lock_id,
                    region,
                    name,
                    topology,
                    node,
                })
            }
            TYPE_UNLOCK_RESPONSE => {
                let status = input.read_u8()?;
                let status = UnlockStatus::from_wire(status)
                    .ok_or(CodecError::UnknownType(status))?;
                Ok(LockProtocol::UnlockResponse { status })
            }
            TYPE_OWNER_REQUEST => {
                let region = input.read_string()?;
                let name = input.read_string()?;
                let topology = read_topology_hash(input)?;
                Ok(LockProtocol::OwnerRequest {
                    region,
                    name,
                    topology,
                })
            }
            TYPE_OWNER_RESPONSE => {
                let thread_id = input.read_u64()?;
                let owner = read_optional_node(input)?;
                let status = input.read_u8()?;
                let status = OwnerStatus::from_wire(status)
                    .ok_or(CodecError::UnknownType(status))?;
                Ok(LockProtocol::OwnerResponse {
                    thread_id,
                    owner,
                    status,
                })
            }
            TYPE_MIGRATION_PREPARE => {
                let region = input.read_string()?;
                let key = read_key(input)?;
                let first_pass = input.read_bool()?;
                let count = read_count(input)?;
                let mut topologies = BTreeMap::new();
                for _ in 0..count {
                    let node = read_node_id(input)?;
                    let hash = if input.read_bool()? {
                        Some(read_topology_hash(input)?)
                    } else {
                        None
                    };
                    topologies.insert(node, hash);
                }
                let locks = read_locks(input)?;
                Ok(LockProtocol::MigrationPrepare {
                    region,
                    key,
                    first_pass,
                    topologies,
                    locks,
                })
            }
            TYPE_MIGRATION_APPLY => {
                let region = input.read_string()?;
                let key = read_key(input)?;
                let locks = read_locks(input)?;
                Ok(LockProtocol::MigrationApply { region, key, locks })
            }
            TYPE_MIGRATION_RESPONSE => {
                let status = input.read_u8()?;
                let status = MigrationStatus::from_wire(status)
                    .ok_or(CodecError::UnknownType(status))?;
                Ok(LockProtocol::MigrationResponse { status })
            }
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_bytes, encode_to_bytes};

    fn hash(seed: u128) -> TopologyHash {
        TopologyHash::of([&NodeId::from_u128(seed)])
    }

    fn round_trip(msg: LockProtocol) {
        let bytes = encode_to_bytes(&LockProtocolCodec, &msg).unwrap();
        assert_eq!(decode_from_bytes(&LockProtocolCodec, bytes).unwrap(), msg);
    }

    #[test]
    fn lock_request_round_trip() {
        round_trip(LockProtocol::LockRequest {
            lock_id: 77,
            region: "orders".into(),
            name: "order-42".into(),
            timeout_ms: 1_500,
            with_feedback: false,
            thread_id: 9,
            topology: hash(1),
            node: NodeId::from_u128(3),
        });
    }

    #[test]
    fn lock_response_round_trip() {
        round_trip(LockProtocol::LockResponse {
            status: LockStatus::Busy,
            owner_thread: 4,
            owner: Some(NodeId::from_u128(8)),
        });
        round_trip(LockProtocol::LockResponse {
            status: LockStatus::Ok,
            owner_thread: 0,
            owner: None,
        });
    }

    #[test]
    fn unlock_round_trip() {
        round_trip(LockProtocol::UnlockRequest {
            lock_id: 77,
            region: "orders".into(),
            name: "order-42".into(),
            topology: hash(2),
            node: NodeId::from_u128(3),
        });
        round_trip(LockProtocol::UnlockResponse {
            status: UnlockStatus::NotOwner,
        });
    }

    #[test]
    fn owner_round_trip() {
        round_trip(LockProtocol::OwnerRequest {
            region: "orders".into(),
            name: "order-42".into(),
            topology: hash(3),
        });
        round_trip(LockProtocol::OwnerResponse {
            thread_id: 11,
            owner: None,
            status: OwnerStatus::Retry,
        });
    }

    #[test]
    fn migration_round_trip() {
        let key = LockMigrationKey {
            node: NodeId::from_u128(1),
            topology: hash(4),
            id: 6,
        };
        let locks = vec![
            LockMigrationInfo {
                name: "a".into(),
                lock_id: 1,
                thread_id: 2,
                node: NodeId::from_u128(5),
            },
            LockMigrationInfo {
                name: "b".into(),
                lock_id: 3,
                thread_id: 4,
                node: NodeId::from_u128(6),
            },
        ];
        let mut topologies = BTreeMap::new();
        topologies.insert(NodeId::from_u128(5), Some(hash(5)));
        topologies.insert(NodeId::from_u128(6), None);

        round_trip(LockProtocol::MigrationPrepare {
            region: "orders".into(),
            key,
            first_pass: true,
            topologies,
            locks: locks.clone(),
        });
        round_trip(LockProtocol::MigrationApply {
            region: "orders".into(),
            key,
            locks,
        });
        round_trip(LockProtocol::MigrationResponse {
            status: MigrationStatus::Ok,
        });
    }
}
