//! Transport-level framing.
//!
//! Every frame on the wire is a `u32` big-endian length prefix followed by a
//! type byte and a body. Type bytes `0..=4` belong to the transport itself;
//! [`TransportFrame::Data`] bodies carry a connector protocol's own message
//! (which starts with that protocol's type byte).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{CodecError, DataReader, DataWriter};

pub(crate) const TYPE_HEARTBEAT: u8 = 0;
pub(crate) const TYPE_HANDSHAKE_REQUEST: u8 = 1;
pub(crate) const TYPE_HANDSHAKE_ACCEPT: u8 = 2;
pub(crate) const TYPE_HANDSHAKE_REJECT: u8 = 3;
pub(crate) const TYPE_DATA: u8 = 4;

/// Hard cap on a single frame, connector payload included.
pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Frames exchanged by the transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportFrame {
    /// Keep-alive pushed on write-idle.
    Heartbeat,
    /// First frame on every connection: selects the connector.
    HandshakeRequest {
        /// Connector protocol identifier.
        protocol: String,
        /// Opaque login payload examined by the server handler.
        login: Bytes,
    },
    /// Server accepted the connection and dictates heartbeat settings.
    HandshakeAccept {
        /// Write-idle interval in milliseconds.
        hb_interval_ms: u32,
        /// Missed intervals tolerated before read timeout.
        hb_loss_threshold: u32,
        /// When set, neither side emits heartbeats (read timeout stays).
        hb_disabled: bool,
    },
    /// Server refused the connection.
    HandshakeReject {
        /// Human-readable rejection reason.
        reason: String,
    },
    /// Connector payload.
    Data(Bytes),
}

impl TransportFrame {
    /// Encodes the frame including its length prefix.
    pub(crate) fn encode(&self) -> Bytes {
        let mut body = DataWriter::new();
        match self {
            Self::Heartbeat => body.write_u8(TYPE_HEARTBEAT),
            Self::HandshakeRequest { protocol, login } => {
                body.write_u8(TYPE_HANDSHAKE_REQUEST);
                body.write_str(protocol);
                body.write_blob(login);
            }
            Self::HandshakeAccept {
                hb_interval_ms,
                hb_loss_threshold,
                hb_disabled,
            } => {
                body.write_u8(TYPE_HANDSHAKE_ACCEPT);
                body.write_i32(*hb_interval_ms as i32);
                body.write_i32(*hb_loss_threshold as i32);
                body.write_bool(*hb_disabled);
            }
            Self::HandshakeReject { reason } => {
                body.write_u8(TYPE_HANDSHAKE_REJECT);
                body.write_str(reason);
            }
            Self::Data(payload) => {
                body.write_u8(TYPE_DATA);
                // Raw payload, not length-prefixed again: the frame length
                // already bounds it.
            }
        }
        let body = body.into_bytes();
        let payload = match self {
            Self::Data(payload) => Some(payload),
            _ => None,
        };
        let payload_len = payload.map_or(0, Bytes::len);

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len() + payload_len);
        frame.put_u32((body.len() + payload_len) as u32);
        frame.put_slice(&body);
        if let Some(payload) = payload {
            frame.put_slice(payload);
        }
        frame.freeze()
    }

    /// Decodes a frame body (length prefix already stripped).
    pub(crate) fn decode(mut body: Bytes) -> Result<Self, CodecError> {
        if body.is_empty() {
            return Err(CodecError::Eof { wanted: 1 });
        }
        let frame_type = body.get_u8();
        match frame_type {
            TYPE_HEARTBEAT => Ok(Self::Heartbeat),
            TYPE_HANDSHAKE_REQUEST => {
                let mut reader = DataReader::new(body);
                let protocol = reader.read_string()?;
                let login = reader.read_blob()?;
                Ok(Self::HandshakeRequest { protocol, login })
            }
            TYPE_HANDSHAKE_ACCEPT => {
                let mut reader = DataReader::new(body);
                let hb_interval_ms = reader.read_i32()? as u32;
                let hb_loss_threshold = reader.read_i32()? as u32;
                let hb_disabled = reader.read_bool()?;
                Ok(Self::HandshakeAccept {
                    hb_interval_ms,
                    hb_loss_threshold,
                    hb_disabled,
                })
            }
            TYPE_HANDSHAKE_REJECT => {
                let mut reader = DataReader::new(body);
                let reason = reader.read_string()?;
                Ok(Self::HandshakeReject { reason })
            }
            TYPE_DATA => Ok(Self::Data(body)),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// Attempts to split one complete frame body off `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. The length prefix is
/// consumed together with the body.
pub(crate) fn try_split_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidLength(len as i32));
    }
    if buf.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    buf.advance(LENGTH_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: TransportFrame) -> TransportFrame {
        let encoded = frame.encode();
        let mut buf = BytesMut::from(&encoded[..]);
        let body = try_split_frame(&mut buf).unwrap().expect("complete frame");
        assert!(buf.is_empty());
        TransportFrame::decode(body).unwrap()
    }

    #[test]
    fn heartbeat_round_trip() {
        assert_eq!(round_trip(TransportFrame::Heartbeat), TransportFrame::Heartbeat);
    }

    #[test]
    fn handshake_request_round_trip() {
        let frame = TransportFrame::HandshakeRequest {
            protocol: "hekate.gossip".into(),
            login: Bytes::from_static(b"cluster-login"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn handshake_accept_round_trip() {
        let frame = TransportFrame::HandshakeAccept {
            hb_interval_ms: 1_000,
            hb_loss_threshold: 3,
            hb_disabled: false,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn handshake_reject_round_trip() {
        let frame = TransportFrame::HandshakeReject {
            reason: "cluster name mismatch".into(),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn data_round_trip() {
        let frame = TransportFrame::Data(Bytes::from_static(&[9, 8, 7, 6]));
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let encoded = TransportFrame::Heartbeat.encode();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(try_split_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(try_split_frame(&mut buf).is_err());
    }

    #[test]
    fn frames_split_back_to_back() {
        let mut buf = BytesMut::new();
        buf.put_slice(&TransportFrame::Heartbeat.encode());
        buf.put_slice(&TransportFrame::Data(Bytes::from_static(b"x")).encode());

        let first = try_split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(TransportFrame::decode(first).unwrap(), TransportFrame::Heartbeat);
        let second = try_split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            TransportFrame::decode(second).unwrap(),
            TransportFrame::Data(Bytes::from_static(b"x"))
        );
    }
}
