//! Inbound message handle and receiver contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::codec::{Codec, encode_to_bytes};
use crate::messaging::MessagingError;
use crate::messaging::protocol::MessagingFrame;
use crate::network::ServerConnection;

/// Error type receivers may bubble up; rendered into the error reply.
pub type ReceiverError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback attached to a channel.
///
/// Runs on the channel's async workers, so blocking (within reason) and
/// awaiting are both fine here. Returning an error is logged and, for
/// requests that were not answered yet, produces an error reply carrying
/// the rendered failure.
#[async_trait]
pub trait MessageReceiver<P>: Send + Sync {
    /// Handles one inbound message.
    async fn receive(&self, msg: Message<P>) -> Result<(), ReceiverError>;
}

/// Reply path of one request; shared between the message handle and the
/// worker that enforces error replies.
pub(crate) struct ReplyHandle<P> {
    correlation: u32,
    stream: bool,
    replied: AtomicBool,
    connection: ServerConnection<MessagingFrame>,
    codec: Arc<dyn Codec<P>>,
}

impl<P> ReplyHandle<P> {
    pub(crate) fn new(
        correlation: u32,
        stream: bool,
        connection: ServerConnection<MessagingFrame>,
        codec: Arc<dyn Codec<P>>,
    ) -> Self {
        Self {
            correlation,
            stream,
            replied: AtomicBool::new(false),
            connection,
            codec,
        }
    }

    pub(crate) fn is_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    async fn send_final(&self, payload: &P) -> Result<(), MessagingError> {
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(MessagingError::AlreadyReplied);
        }
        let payload = encode_to_bytes(self.codec.as_ref(), payload)?;
        self.connection
            .send(&MessagingFrame::FinalResponse {
                correlation: self.correlation,
                payload,
            })
            .await?;
        Ok(())
    }

    async fn send_chunk(&self, payload: &P) -> Result<(), MessagingError> {
        if !self.stream {
            return Err(MessagingError::PartialNotExpected);
        }
        if self.is_replied() {
            return Err(MessagingError::AlreadyReplied);
        }
        let payload = encode_to_bytes(self.codec.as_ref(), payload)?;
        self.connection
            .send(&MessagingFrame::ResponseChunk {
                correlation: self.correlation,
                payload,
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn send_error(&self, rendered: String) {
        if self.replied.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .connection
            .send(&MessagingFrame::ErrorResponse {
                correlation: self.correlation,
                stack_trace: rendered,
            })
            .await;
    }
}

/// One inbound message handed to a [`MessageReceiver`].
pub struct Message<P> {
    payload: P,
    reply: Option<Arc<ReplyHandle<P>>>,
}

impl<P> Message<P> {
    pub(crate) fn new(payload: P, reply: Option<Arc<ReplyHandle<P>>>) -> Self {
        Self { payload, reply }
    }

    /// Borrow the decoded payload.
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Consumes the handle, keeping the reply path alive separately.
    #[must_use]
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Whether the sender expects a reply.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }

    /// Whether the sender accepts partial replies before the final one.
    #[must_use]
    pub fn is_stream_request(&self) -> bool {
        self.reply.as_ref().is_some_and(|reply| reply.stream)
    }

    /// Sends the final reply, completing the remote request.
    pub async fn reply(&self, payload: P) -> Result<(), MessagingError> {
        match &self.reply {
            Some(handle) => handle.send_final(&payload).await,
            None => Err(MessagingError::ReplyNotExpected),
        }
    }

    /// Sends one partial reply; only valid for stream requests.
    pub async fn reply_partial(&self, payload: P) -> Result<(), MessagingError> {
        match &self.reply {
            Some(handle) => handle.send_chunk(&payload).await,
            None => Err(MessagingError::ReplyNotExpected),
        }
    }

    pub(crate) fn reply_handle(&self) -> Option<Arc<ReplyHandle<P>>> {
        self.reply.clone()
    }
}
