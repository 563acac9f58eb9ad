//! Coordination wire protocol.
//!
//! Rounds are identified by the hash of the process sub-topology they were
//! started under; members reject requests from rounds they have not caught
//! up with yet, and the coordinator retries.

use bytes::Bytes;

use crate::cluster::TopologyHash;
use crate::codec::{Codec, CodecError, DataReader, DataWriter};

const TYPE_REQUEST: u8 = 40;
const TYPE_RESPONSE: u8 = 41;
const TYPE_REJECT: u8 = 42;
const TYPE_COMPLETE: u8 = 43;

/// Messages of the coordination protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationMessage {
    /// Coordinator-broadcast application request.
    Request {
        /// Process name.
        process: String,
        /// Round identifier (process sub-topology hash).
        round: TopologyHash,
        /// Application payload.
        payload: Bytes,
    },
    /// Member reply carrying the handler's response.
    Response {
        /// Application payload.
        payload: Bytes,
    },
    /// Member is not (yet) part of this round; the coordinator retries.
    Reject,
    /// Coordinator signal that the round completed.
    Complete {
        /// Process name.
        process: String,
        /// Round identifier.
        round: TopologyHash,
    },
}

/// Stateless codec for [`CoordinationMessage`].
pub struct CoordinationCodec;

fn write_hash(hash: &TopologyHash, out: &mut DataWriter) {
    for byte in hash.as_bytes() {
        out.write_u8(*byte);
    }
}

fn read_hash(input: &mut DataReader) -> Result<TopologyHash, CodecError> {
    let mut bytes = [0u8; 16];
    for byte in &mut bytes {
        *byte = input.read_u8()?;
    }
    Ok(TopologyHash::from_bytes(bytes))
}

impl Codec<CoordinationMessage> for CoordinationCodec {
    fn encode(&self, msg: &CoordinationMessage, out: &mut DataWriter) -> Result<(), CodecError> {
        match msg {
            CoordinationMessage::Request {
                process,
                round,
                payload,
            } => {
                out.write_u8(TYPE_REQUEST);
                out.write_str(process);
                write_hash(round, out);
                out.write_blob(payload);
            }
            CoordinationMessage::Response { payload } => {
                out.write_u8(TYPE_RESPONSE);
                out.write_blob(payload);
            }
            CoordinationMessage::Reject => out.write_u8(TYPE_REJECT),
            CoordinationMessage::Complete { process, round } => {
                out.write_u8(TYPE_COMPLETE);
                out.write_str(process);
                write_hash(round, out);
            }
        }
        Ok(())
    }

    fn decode(&self, input: &mut DataReader) -> Result<CoordinationMessage, CodecError> {
        match input.read_u8()? {
            TYPE_REQUEST => Ok(CoordinationMessage::Request {
                process: input.read_string()?,
                round: read_hash(input)?,
                payload: input.read_blob()?,
            }),
            TYPE_RESPONSE => Ok(CoordinationMessage::Response {
                payload: input.read_blob()?,
            }),
            TYPE_REJECT => Ok(CoordinationMessage::Reject),
            TYPE_COMPLETE => Ok(CoordinationMessage::Complete {
                process: input.read_string()?,
                round: read_hash(input)?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_bytes, encode_to_bytes};
    use crate::node::NodeId;

    fn round_trip(msg: CoordinationMessage) {
        let bytes = encode_to_bytes(&CoordinationCodec, &msg).unwrap();
        assert_eq!(decode_from_bytes(&CoordinationCodec, bytes).unwrap(), msg);
    }

    #[test]
    fn all_messages_round_trip() {
        let round = TopologyHash::of([&NodeId::from_u128(1), &NodeId::from_u128(2)]);
        round_trip(CoordinationMessage::Request {
            process: "election".into(),
            round,
            payload: Bytes::from_static(b"vote"),
        });
        round_trip(CoordinationMessage::Response {
            payload: Bytes::from_static(b"ack"),
        });
        round_trip(CoordinationMessage::Reject);
        round_trip(CoordinationMessage::Complete {
            process: "election".into(),
            round,
        });
    }
}
