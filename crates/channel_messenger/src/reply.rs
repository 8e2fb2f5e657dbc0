use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{trace, warn};

use crate::error::MessengerError;
use crate::transport::{NativeTransport, ReplyId};

/// Callback run when the engine answers an outbound send.
///
/// An `Err` is logged by the messenger and goes no further.
pub type ReplyCallback = Box<dyn FnOnce(Option<Vec<u8>>) -> anyhow::Result<()> + Send + 'static>;

/// Shared completion state of one inbound message.
///
/// The messenger keeps a handle to it next to the handler's [`BinaryReply`], so a
/// failing handler can still be answered, and the `done` flag makes sure only one
/// answer ever reaches the transport.
pub(crate) struct ReplyState {
    transport: Arc<dyn NativeTransport>,
    channel: String,
    reply_id: ReplyId,
    done: AtomicBool,
}

impl ReplyState {
    pub(crate) fn new(
        transport: Arc<dyn NativeTransport>,
        channel: String,
        reply_id: ReplyId,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            channel,
            reply_id,
            done: AtomicBool::new(false),
        })
    }

    pub(crate) fn reply_id(&self) -> ReplyId {
        self.reply_id
    }

    fn submit(&self, reply: Option<Vec<u8>>) -> Result<(), MessengerError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(MessengerError::ReplyAlreadySubmitted(self.reply_id));
        }
        trace!(channel = %self.channel, reply_id = self.reply_id, empty = reply.is_none(), "replying");
        match reply {
            Some(bytes) => self.transport.send_reply_bytes(self.reply_id, bytes),
            None => self.transport.send_empty_reply(self.reply_id),
        }
        Ok(())
    }

    /// Answer with an empty reply unless someone already answered.
    pub(crate) fn reply_empty_if_pending(&self) -> bool {
        self.submit(None).is_ok()
    }
}

impl Drop for ReplyState {
    fn drop(&mut self) {
        if !*self.done.get_mut() {
            warn!(
                channel = %self.channel,
                reply_id = self.reply_id,
                "reply sink dropped without replying; sending empty reply"
            );
            *self.done.get_mut() = true;
            self.transport.send_empty_reply(self.reply_id);
        }
    }
}

/// Single-use reply sink handed to a channel handler.
///
/// It may be moved to another thread and answered later. Replying twice is an
/// error; never replying at all results in an empty reply once the sink drops.
pub struct BinaryReply {
    state: Arc<ReplyState>,
}

impl BinaryReply {
    pub(crate) fn new(state: Arc<ReplyState>) -> Self {
        Self { state }
    }

    pub fn reply(&self, reply: Option<Vec<u8>>) -> Result<(), MessengerError> {
        self.state.submit(reply)
    }

    pub fn reply_id(&self) -> ReplyId {
        self.state.reply_id()
    }
}

impl fmt::Debug for BinaryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryReply")
            .field("channel", &self.state.channel)
            .field("reply_id", &self.state.reply_id)
            .finish()
    }
}
