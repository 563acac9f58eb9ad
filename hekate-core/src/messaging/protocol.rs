//! Messaging wire frames.
//!
//! Frames carry the user payload as opaque bytes produced by the channel's
//! codec; correlation ids are 31-bit per-connection counters.

use bytes::Bytes;

use crate::codec::{Codec, CodecError, DataReader, DataWriter};

const TYPE_NOTIFICATION: u8 = 20;
const TYPE_REQUEST: u8 = 21;
const TYPE_STREAM_REQUEST: u8 = 22;
const TYPE_RESPONSE_CHUNK: u8 = 23;
const TYPE_FINAL_RESPONSE: u8 = 24;
const TYPE_ERROR_RESPONSE: u8 = 25;

/// Frames exchanged on a messaging connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingFrame {
    /// Fire-and-forget message; never replied to.
    Notification {
        /// Affinity hash pinning worker/connection selection.
        affinity: Option<u32>,
        /// Encoded user payload.
        payload: Bytes,
    },
    /// Request expecting exactly one final reply.
    Request {
        /// Correlation id echoed by the reply.
        correlation: u32,
        /// Affinity hash pinning worker/connection selection.
        affinity: Option<u32>,
        /// Encoded user payload.
        payload: Bytes,
    },
    /// Request expecting zero or more chunks and then a final reply.
    StreamRequest {
        /// Correlation id echoed by every reply part.
        correlation: u32,
        /// Affinity hash pinning worker/connection selection.
        affinity: Option<u32>,
        /// Encoded user payload.
        payload: Bytes,
    },
    /// Partial reply to a [`MessagingFrame::StreamRequest`].
    ResponseChunk {
        /// Correlation id of the originating request.
        correlation: u32,
        /// Encoded user payload.
        payload: Bytes,
    },
    /// Final reply completing a request.
    FinalResponse {
        /// Correlation id of the originating request.
        correlation: u32,
        /// Encoded user payload.
        payload: Bytes,
    },
    /// Remote receiver failed; carries a rendered error description.
    ErrorResponse {
        /// Correlation id of the originating request.
        correlation: u32,
        /// String rendering of the remote failure.
        stack_trace: String,
    },
}

impl MessagingFrame {
    /// Correlation id, when the frame has one.
    #[must_use]
    pub const fn correlation(&self) -> Option<u32> {
        match self {
            Self::Notification { .. } => None,
            Self::Request { correlation, .. }
            | Self::StreamRequest { correlation, .. }
            | Self::ResponseChunk { correlation, .. }
            | Self::FinalResponse { correlation, .. }
            | Self::ErrorResponse { correlation, .. } => Some(*correlation),
        }
    }
}

fn write_affinity(affinity: Option<u32>, out: &mut DataWriter) {
    match affinity {
        Some(value) => {
            out.write_bool(true);
            out.write_u32(value);
        }
        None => out.write_bool(false),
    }
}

fn read_affinity(input: &mut DataReader) -> Result<Option<u32>, CodecError> {
    if input.read_bool()? {
        Ok(Some(input.read_u32()?))
    } else {
        Ok(None)
    }
}

/// Stateless codec for [`MessagingFrame`].
pub struct MessagingFrameCodec;

impl Codec<MessagingFrame> for MessagingFrameCodec {
    fn encode(&self, msg: &MessagingFrame, out: &mut DataWriter) -> Result<(), CodecError> {
        match msg {
            MessagingFrame::Notification { affinity, payload } => {
                out.write_u8(TYPE_NOTIFICATION);
                write_affinity(*affinity, out);
                out.write_blob(payload);
            }
            MessagingFrame::Request {
                correlation,
                affinity,
                payload,
            } => {
                out.write_u8(TYPE_REQUEST);
                out.write_u32(*correlation);
                write_affinity(*affinity, out);
                out.write_blob(payload);
            }
            MessagingFrame::StreamRequest {
                correlation,
                affinity,
                payload,
            } => {
                out.write_u8(TYPE_STREAM_REQUEST);
                out.write_u32(*correlation);
                write_affinity(*affinity, out);
                out.write_blob(payload);
            }
            MessagingFrame::ResponseChunk {
                correlation,
                payload,
            } => {
                out.write_u8(TYPE_RESPONSE_CHUNK);
                out.write_u32(*correlation);
                out.write_blob(payload);
            }
            MessagingFrame::FinalResponse {
                correlation,
                payload,
            } => {
                out.write_u8(TYPE_FINAL_RESPONSE);
                out.write_u32(*correlation);
                out.write_blob(payload);
            }
            MessagingFrame::ErrorResponse {
                correlation,
                stack_trace,
            } => {
                out.write_u8(TYPE_ERROR_RESPONSE);
                out.write_u32(*correlation);
                out.write_str(stack_trace);
            }
        }
        Ok(())
    }

    fn decode(&self, input: &mut DataReader) -> Result<MessagingFrame, CodecError> {
        match input.read_u8()? {
            TYPE_NOTIFICATION => Ok(MessagingFrame::Notification {
                affinity: read_affinity(input)?,
                payload: input.read_blob()?,
            }),
            TYPE_REQUEST => Ok(MessagingFrame::Request {
                correlation: input.read_u32()?,
                affinity: read_affinity(input)?,
                payload: input.read_blob()?,
            }),
            TYPE_STREAM_REQUEST => Ok(MessagingFrame::StreamRequest {
                correlation: input.read_u32()?,
                affinity: read_affinity(input)?,
                payload: input.read_blob()?,
            }),
            TYPE_RESPONSE_CHUNK => Ok(MessagingFrame::ResponseChunk {
                correlation: input.read_u32()?,
                payload: input.read_blob()?,
            }),
            TYPE_FINAL_RESPONSE => Ok(MessagingFrame::FinalResponse {
                correlation: input.read_u32()?,
                payload: input.read_blob()?,
            }),
            TYPE_ERROR_RESPONSE => Ok(MessagingFrame::ErrorResponse {
                correlation: input.read_u32()?,
                stack_trace: input.read_string()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_bytes, encode_to_bytes};

    fn round_trip(frame: MessagingFrame) {
        let bytes = encode_to_bytes(&MessagingFrameCodec, &frame).unwrap();
        assert_eq!(decode_from_bytes(&MessagingFrameCodec, bytes).unwrap(), frame);
    }

    #[test]
    fn all_frames_round_trip() {
        round_trip(MessagingFrame::Notification {
            affinity: None,
            payload: Bytes::from_static(b"n"),
        });
        round_trip(MessagingFrame::Notification {
            affinity: Some(42),
            payload: Bytes::from_static(b"n2"),
        });
        round_trip(MessagingFrame::Request {
            correlation: 7,
            affinity: Some(1),
            payload: Bytes::from_static(b"req"),
        });
        round_trip(MessagingFrame::StreamRequest {
            correlation: 8,
            affinity: None,
            payload: Bytes::from_static(b"sub"),
        });
        round_trip(MessagingFrame::ResponseChunk {
            correlation: 8,
            payload: Bytes::from_static(b"part"),
        });
        round_trip(MessagingFrame::FinalResponse {
            correlation: 7,
            payload: Bytes::from_static(b"done"),
        });
        round_trip(MessagingFrame::ErrorResponse {
            correlation: 7,
            stack_trace: "boom at line 3".into(),
        });
    }

    #[test]
    fn correlation_extraction() {
        assert_eq!(
            MessagingFrame::Notification {
                affinity: None,
                payload: Bytes::new()
            }
            .correlation(),
            None
        );
        assert_eq!(
            MessagingFrame::FinalResponse {
                correlation: 3,
                payload: Bytes::new()
            }
            .correlation(),
            Some(3)
        );
    }
}
