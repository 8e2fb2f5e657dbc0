//! The boundary between the messenger and the native bridge it multiplexes over.
//!
//! The messenger only ever talks to a [`NativeTransport`] handed to it at
//! construction, and the transport only ever calls back through
//! [`PlatformMessageHandler`]. Nothing here is global, so several messengers can
//! share a process (and a test).

/// Correlates an outbound send with its eventual response.
pub type ReplyId = i64;

/// Opaque transport-owned handle attached to every inbound message.
///
/// It must be handed back through [`NativeTransport::release_message_resources`]
/// exactly once, whatever happened to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageToken(pub u64);

impl std::fmt::Display for MessageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Outbound half of the native bridge.
///
/// Absent payloads always go through the `*_empty_*` variants, so the byte
/// variants never see an empty `Option`.
pub trait NativeTransport: Send + Sync + 'static {
    /// Forward a message to the engine on `channel`.
    fn dispatch_message(&self, channel: &str, message: Vec<u8>, reply_id: ReplyId);

    /// Forward a message without payload to the engine on `channel`.
    fn dispatch_empty_message(&self, channel: &str, reply_id: ReplyId);

    /// Answer the engine message tagged `reply_id`.
    fn send_reply_bytes(&self, reply_id: ReplyId, reply: Vec<u8>);

    /// Answer the engine message tagged `reply_id` with nothing.
    fn send_empty_reply(&self, reply_id: ReplyId);

    /// Give back whatever the transport attached to an inbound message.
    fn release_message_resources(&self, token: MessageToken);
}

/// Inbound half of the native bridge, implemented by the messenger.
///
/// `handle_message_from_engine` may be called from any transport thread,
/// concurrently with itself, and must never block on handler code.
pub trait PlatformMessageHandler: Send + Sync + 'static {
    fn handle_message_from_engine(
        &self,
        channel: &str,
        message: Option<Vec<u8>>,
        reply_id: ReplyId,
        token: MessageToken,
    );

    fn handle_platform_message_response(&self, reply_id: ReplyId, reply: Option<Vec<u8>>);
}
