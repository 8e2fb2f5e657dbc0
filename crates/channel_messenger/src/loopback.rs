//! In-process transport joining two messengers back to back.
//!
//! Whatever one side sends arrives at the other side's
//! [`PlatformMessageHandler::handle_message_from_engine`], tagged with a message
//! token minted by the receiving transport; replies travel back to the sender's
//! `handle_platform_message_response`. Each transport keeps the tokens it handed
//! out until they are released, so a drained pair has none outstanding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tracing::{trace, warn};

use crate::error::MessengerError;
use crate::messenger::{ChannelMessenger, MessengerBuilder};
use crate::transport::{MessageToken, NativeTransport, PlatformMessageHandler, ReplyId};

pub struct LoopbackTransport {
    side: &'static str,
    peer: OnceLock<Weak<LoopbackTransport>>,
    handler: OnceLock<Weak<dyn PlatformMessageHandler>>,
    next_token: AtomicU64,
    outstanding: DashMap<u64, String>,
}

impl LoopbackTransport {
    pub fn new(side: &'static str) -> Arc<Self> {
        Arc::new(Self {
            side,
            peer: OnceLock::new(),
            handler: OnceLock::new(),
            next_token: AtomicU64::new(1),
            outstanding: DashMap::new(),
        })
    }

    /// Connect two transports to each other.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        if a.peer.set(Arc::downgrade(b)).is_err() || b.peer.set(Arc::downgrade(a)).is_err() {
            warn!(a = a.side, b = b.side, "loopback transport already linked");
        }
    }

    /// The messenger that receives what the peer sends. Held weakly, since the
    /// messenger owns this transport.
    pub fn attach<H: PlatformMessageHandler>(&self, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn PlatformMessageHandler> = weak;
        if self.handler.set(weak).is_err() {
            warn!(side = self.side, "loopback transport already has a handler");
        }
    }

    pub fn side(&self) -> &'static str {
        self.side
    }

    /// Tokens handed to this side's messenger and not yet released.
    pub fn outstanding_message_count(&self) -> usize {
        self.outstanding.len()
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn handler(&self) -> Option<Arc<dyn PlatformMessageHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn deliver(&self, channel: &str, message: Option<Vec<u8>>, reply_id: ReplyId) {
        let delivered = self.peer().and_then(|peer| {
            let handler = peer.handler()?;
            let token = peer.next_token.fetch_add(1, Ordering::Relaxed);
            peer.outstanding.insert(token, channel.to_owned());
            trace!(from = self.side, to = peer.side, channel, reply_id, token, "loopback message");
            handler.handle_message_from_engine(channel, message, reply_id, MessageToken(token));
            Some(())
        });
        if delivered.is_none() {
            warn!(side = self.side, channel, reply_id, "no peer to deliver to; answering empty");
            if let Some(handler) = self.handler() {
                handler.handle_platform_message_response(reply_id, None);
            }
        }
    }

    fn respond(&self, reply_id: ReplyId, reply: Option<Vec<u8>>) {
        match self.peer().and_then(|peer| peer.handler()) {
            Some(handler) => handler.handle_platform_message_response(reply_id, reply),
            None => warn!(side = self.side, reply_id, "no peer to answer; reply lost"),
        }
    }
}

impl NativeTransport for LoopbackTransport {
    fn dispatch_message(&self, channel: &str, message: Vec<u8>, reply_id: ReplyId) {
        self.deliver(channel, Some(message), reply_id);
    }

    fn dispatch_empty_message(&self, channel: &str, reply_id: ReplyId) {
        self.deliver(channel, None, reply_id);
    }

    fn send_reply_bytes(&self, reply_id: ReplyId, reply: Vec<u8>) {
        self.respond(reply_id, Some(reply));
    }

    fn send_empty_reply(&self, reply_id: ReplyId) {
        self.respond(reply_id, None);
    }

    fn release_message_resources(&self, token: MessageToken) {
        if self.outstanding.remove(&token.0).is_none() {
            warn!(side = self.side, %token, "message token released twice or never issued");
        }
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("side", &self.side)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

/// Two messengers wired to each other: `platform` sends reach `engine` and the
/// other way round.
#[derive(Debug)]
pub struct LoopbackPair {
    pub platform: Arc<ChannelMessenger>,
    pub platform_transport: Arc<LoopbackTransport>,
    pub engine: Arc<ChannelMessenger>,
    pub engine_transport: Arc<LoopbackTransport>,
}

impl LoopbackPair {
    pub fn connect() -> Result<Self, MessengerError> {
        Self::connect_with(|builder| builder)
    }

    /// `configure` is applied to both sides' builders.
    pub fn connect_with<F>(configure: F) -> Result<Self, MessengerError>
    where
        F: Fn(MessengerBuilder) -> MessengerBuilder,
    {
        let platform_transport = LoopbackTransport::new("platform");
        let engine_transport = LoopbackTransport::new("engine");
        LoopbackTransport::link(&platform_transport, &engine_transport);

        let platform = configure(
            ChannelMessenger::builder(platform_transport.clone()).platform_thread_name("platform"),
        )
        .build()?;
        let engine = configure(
            ChannelMessenger::builder(engine_transport.clone()).platform_thread_name("engine"),
        )
        .build()?;

        let platform = Arc::new(platform);
        let engine = Arc::new(engine);
        platform_transport.attach(&platform);
        engine_transport.attach(&engine);

        Ok(Self {
            platform,
            platform_transport,
            engine,
            engine_transport,
        })
    }

    /// Unreleased tokens on both sides.
    pub fn outstanding_message_count(&self) -> usize {
        self.platform_transport.outstanding_message_count()
            + self.engine_transport.outstanding_message_count()
    }

    /// Unanswered sends on both sides.
    pub fn pending_reply_count(&self) -> usize {
        self.platform.pending_channel_response_count() + self.engine.pending_channel_response_count()
    }
}
