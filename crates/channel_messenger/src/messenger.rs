//! Channel multiplexer: many named binary channels over one [`NativeTransport`].
//!
//! Inbound messages are routed by channel name to a registered handler and run on
//! the handler's task queue (the platform queue unless a background queue was
//! bound). Every inbound message is answered exactly once and its transport token
//! released exactly once, whatever the handler does. Outbound sends get a fresh
//! reply id and, optionally, a callback parked until the engine answers.
//!
//! ```ignore
//! let messenger = ChannelMessenger::new(transport)?;
//! let queue = messenger.make_background_task_queue(TaskQueueOptions::default());
//! messenger.set_message_handler(
//!     "ping",
//!     Some(message_handler(|_msg, reply| Ok(reply.reply(Some(b"pong".to_vec()))?))),
//!     Some(&queue),
//! )?;
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, debug_span, error, trace, trace_span};

use crate::error::MessengerError;
use crate::reply::{BinaryReply, ReplyCallback, ReplyState};
use crate::task_queue::{
    DefaultTaskQueueFactory, PlatformTaskQueue, QueueRegistry, TaskQueue, TaskQueueFactory,
    TaskQueueOptions, TaskQueueToken,
};
use crate::transport::{MessageToken, NativeTransport, PlatformMessageHandler, ReplyId};
use crate::util::lock;

/// Handler bound to a channel. Returning `Err` answers the message with an empty
/// reply (unless the handler already replied); panicking is treated as fatal.
pub type MessageHandler =
    Arc<dyn Fn(Option<Vec<u8>>, BinaryReply) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Receives panics escaping handlers and reply callbacks. Without one, the panic
/// resumes on whichever thread ran the handler.
pub type FatalErrorHook = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync + 'static>;

pub const DEFAULT_PLATFORM_THREAD: &str = "platform";

pub fn message_handler<F>(f: F) -> MessageHandler
where
    F: Fn(Option<Vec<u8>>, BinaryReply) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The application-facing side of the multiplexer.
///
/// `send`, `set_message_handler` and the buffering toggles belong to the control
/// thread by convention; they take `&self` and are internally consistent, but
/// their relative order is the caller's business.
pub trait BinaryMessenger: Send + Sync {
    fn send(&self, channel: &str, message: Option<Vec<u8>>, callback: Option<ReplyCallback>);

    /// `None` removes the channel's handler. A `queue` must come from this
    /// messenger's [`make_background_task_queue`](Self::make_background_task_queue).
    fn set_message_handler(
        &self,
        channel: &str,
        handler: Option<MessageHandler>,
        queue: Option<&TaskQueueToken>,
    ) -> Result<(), MessengerError>;

    fn make_background_task_queue(&self, options: TaskQueueOptions) -> TaskQueueToken;

    fn enable_buffering_incoming_messages(&self);

    fn disable_buffering_incoming_messages(&self);
}

#[derive(Clone)]
struct HandlerInfo {
    handler: MessageHandler,
    queue: Option<BoundQueue>,
}

/// The token is kept so a bound queue stays registered for as long as the binding.
#[derive(Clone)]
struct BoundQueue {
    _token: TaskQueueToken,
    queue: Arc<dyn TaskQueue>,
}

struct BufferedMessage {
    message: Option<Vec<u8>>,
    reply_id: ReplyId,
    token: MessageToken,
    received_at: Instant,
}

impl BufferedMessage {
    fn new(message: Option<Vec<u8>>, reply_id: ReplyId, token: MessageToken) -> Self {
        Self {
            message,
            reply_id,
            token,
            received_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, HandlerInfo>,
    /// `Some` while buffering is enabled.
    buffered: Option<HashMap<String, Vec<BufferedMessage>>>,
    /// Backlogs being handed to their queues outside the lock. New arrivals for
    /// these channels join the backlog instead of overtaking it.
    draining: HashMap<String, VecDeque<BufferedMessage>>,
}

impl Registry {
    /// Queue `messages` behind any backlog already draining for `channel`.
    /// Returns true when the caller has to start draining it.
    fn queue_backlog(&mut self, channel: &str, messages: Vec<BufferedMessage>) -> bool {
        if messages.is_empty() {
            return false;
        }
        match self.draining.get_mut(channel) {
            Some(backlog) => {
                backlog.extend(messages);
                false
            }
            None => {
                self.draining.insert(channel.to_owned(), messages.into());
                true
            }
        }
    }
}

/// Releases an inbound message's transport resources when dropped.
struct MessageResources {
    transport: Arc<dyn NativeTransport>,
    token: MessageToken,
}

impl Drop for MessageResources {
    fn drop(&mut self) {
        self.transport.release_message_resources(self.token);
    }
}

pub struct MessengerBuilder {
    transport: Arc<dyn NativeTransport>,
    platform_queue: Option<Arc<dyn TaskQueue>>,
    task_queue_factory: Option<Arc<dyn TaskQueueFactory>>,
    platform_thread_name: String,
    fatal_error_hook: Option<FatalErrorHook>,
    buffer_incoming: bool,
}

impl MessengerBuilder {
    fn new(transport: Arc<dyn NativeTransport>) -> Self {
        Self {
            transport,
            platform_queue: None,
            task_queue_factory: None,
            platform_thread_name: DEFAULT_PLATFORM_THREAD.to_owned(),
            fatal_error_hook: None,
            buffer_incoming: false,
        }
    }

    /// Use an existing queue as the platform queue instead of spawning a thread.
    pub fn platform_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.platform_queue = Some(queue);
        self
    }

    pub fn task_queue_factory(mut self, factory: Arc<dyn TaskQueueFactory>) -> Self {
        self.task_queue_factory = Some(factory);
        self
    }

    pub fn platform_thread_name(mut self, name: impl Into<String>) -> Self {
        self.platform_thread_name = name.into();
        self
    }

    pub fn fatal_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.fatal_error_hook = Some(Arc::new(hook));
        self
    }

    /// Start with incoming-message buffering already enabled.
    pub fn buffer_incoming(mut self, enabled: bool) -> Self {
        self.buffer_incoming = enabled;
        self
    }

    pub fn build(self) -> Result<ChannelMessenger, MessengerError> {
        let task_queue_factory: Arc<dyn TaskQueueFactory> = match self.task_queue_factory {
            Some(factory) => factory,
            None => Arc::new(DefaultTaskQueueFactory::current()?),
        };
        let platform_queue: Arc<dyn TaskQueue> = match self.platform_queue {
            Some(queue) => queue,
            None => Arc::new(PlatformTaskQueue::spawn(self.platform_thread_name)?),
        };
        let registry = Registry {
            buffered: self.buffer_incoming.then(HashMap::new),
            ..Registry::default()
        };

        Ok(ChannelMessenger {
            transport: self.transport,
            registry: Mutex::new(registry),
            pending_replies: Mutex::new(HashMap::new()),
            next_reply_id: AtomicI64::new(1),
            platform_queue,
            task_queue_factory,
            task_queues: QueueRegistry::new(),
            fatal_error_hook: self.fatal_error_hook,
        })
    }
}

pub struct ChannelMessenger {
    transport: Arc<dyn NativeTransport>,
    registry: Mutex<Registry>,
    pending_replies: Mutex<HashMap<ReplyId, ReplyCallback>>,
    next_reply_id: AtomicI64,
    platform_queue: Arc<dyn TaskQueue>,
    task_queue_factory: Arc<dyn TaskQueueFactory>,
    task_queues: QueueRegistry,
    fatal_error_hook: Option<FatalErrorHook>,
}

impl ChannelMessenger {
    pub fn builder(transport: Arc<dyn NativeTransport>) -> MessengerBuilder {
        MessengerBuilder::new(transport)
    }

    /// Messenger with a dedicated platform thread and background queues on the
    /// current tokio runtime.
    pub fn new(transport: Arc<dyn NativeTransport>) -> Result<Self, MessengerError> {
        Self::builder(transport).build()
    }

    /// Outbound sends still waiting for their reply.
    pub fn pending_channel_response_count(&self) -> usize {
        lock(&self.pending_replies).len()
    }

    /// Background queues whose tokens are still alive.
    pub fn background_task_queue_count(&self) -> usize {
        self.task_queues.len()
    }

    /// `send` with a callback, awaited.
    ///
    /// There is no timeout: the engine is expected to answer every message. A
    /// caller wrapping this in `tokio::time::timeout` leaves the pending entry in
    /// place until the answer eventually arrives.
    pub async fn call(
        &self,
        channel: &str,
        message: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, MessengerError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            channel,
            message,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
                Ok(())
            })),
        );
        rx.await
            .map_err(|_| MessengerError::ReplyDropped(channel.to_owned()))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    /// Hand `channel`'s backlog to its queue without holding the registry lock, so
    /// a task dropped on dispatch may call back into this messenger. The entry is
    /// removed only once it is empty.
    fn deliver_backlog(&self, channel: &str) {
        loop {
            let (info, batch) = {
                let mut registry = self.registry();
                let Some(backlog) = registry.draining.get_mut(channel) else {
                    return;
                };
                if backlog.is_empty() {
                    registry.draining.remove(channel);
                    return;
                }
                let batch = std::mem::take(backlog);
                (registry.handlers.get(channel).cloned(), batch)
            };
            for buffered in batch {
                debug!(
                    channel,
                    reply_id = buffered.reply_id,
                    handled = info.is_some(),
                    waited_ms = buffered.received_at.elapsed().as_millis() as u64,
                    "delivering buffered message"
                );
                self.dispatch_message_to_queue(
                    channel,
                    info.clone(),
                    buffered.message,
                    buffered.reply_id,
                    buffered.token,
                );
            }
        }
    }

    /// Answer immediately when there is no handler, otherwise hand the message to
    /// the handler's queue without waiting for it.
    fn dispatch_message_to_queue(
        &self,
        channel: &str,
        info: Option<HandlerInfo>,
        message: Option<Vec<u8>>,
        reply_id: ReplyId,
        token: MessageToken,
    ) {
        let Some(info) = info else {
            debug!(channel, reply_id, "no registered handler for message; responding with empty reply");
            self.transport.send_empty_reply(reply_id);
            self.transport.release_message_resources(token);
            return;
        };

        let queue = match &info.queue {
            Some(bound) => Arc::clone(&bound.queue),
            None => Arc::clone(&self.platform_queue),
        };
        trace!(channel, reply_id, queue = %queue.kind(), "dispatching message");

        // Both guards travel with the task, so a task the queue never runs still
        // gets its token released and its reply sent.
        let resources = MessageResources {
            transport: Arc::clone(&self.transport),
            token,
        };
        let reply = ReplyState::new(Arc::clone(&self.transport), channel.to_owned(), reply_id);
        let hook = self.fatal_error_hook.clone();
        let channel = channel.to_owned();

        queue.dispatch(Box::new(move || {
            let _resources = resources;
            invoke_handler(&channel, &info.handler, message, reply, hook.as_ref());
        }));
    }
}

fn invoke_handler(
    channel: &str,
    handler: &MessageHandler,
    message: Option<Vec<u8>>,
    reply: Arc<ReplyState>,
    hook: Option<&FatalErrorHook>,
) {
    let reply_id = reply.reply_id();
    let span = debug_span!("channel_message", channel, reply_id);
    let _enter = span.enter();

    let sink = BinaryReply::new(Arc::clone(&reply));
    match panic::catch_unwind(AssertUnwindSafe(move || handler(message, sink))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(channel, reply_id, error = ?err, "uncaught error in binary message handler");
            reply.reply_empty_if_pending();
        }
        Err(payload) => {
            drop(reply);
            forward_fatal(hook, payload);
        }
    }
}

fn forward_fatal(hook: Option<&FatalErrorHook>, payload: Box<dyn Any + Send>) {
    match hook {
        Some(hook) => hook(payload),
        None => {
            // A background job swallows the resumed unwind.
            error!(panic = panic_message(payload.as_ref()), "fatal error with no hook; re-raising");
            panic::resume_unwind(payload)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl BinaryMessenger for ChannelMessenger {
    fn send(&self, channel: &str, message: Option<Vec<u8>>, callback: Option<ReplyCallback>) {
        let _span = trace_span!("send", channel).entered();
        let reply_id = self.next_reply_id.fetch_add(1, Ordering::SeqCst);
        if let Some(callback) = callback {
            lock(&self.pending_replies).insert(reply_id, callback);
        }
        match message {
            Some(bytes) => self.transport.dispatch_message(channel, bytes, reply_id),
            None => self.transport.dispatch_empty_message(channel, reply_id),
        }
    }

    fn set_message_handler(
        &self,
        channel: &str,
        handler: Option<MessageHandler>,
        queue: Option<&TaskQueueToken>,
    ) -> Result<(), MessengerError> {
        let Some(handler) = handler else {
            debug!(channel, "removing message handler");
            self.registry().handlers.remove(channel);
            return Ok(());
        };

        let queue = match queue {
            Some(token) => {
                let resolved = self
                    .task_queues
                    .resolve(token)
                    .ok_or(MessengerError::UnrecognizedTaskQueue(token.id()))?;
                Some(BoundQueue {
                    _token: token.clone(),
                    queue: resolved,
                })
            }
            None => None,
        };
        let info = HandlerInfo { handler, queue };

        debug!(channel, background = info.queue.is_some(), "setting message handler");
        let start_drain = {
            let mut registry = self.registry();
            registry.handlers.insert(channel.to_owned(), info);
            let backlog = registry
                .buffered
                .as_mut()
                .and_then(|buffered| buffered.remove(channel))
                .unwrap_or_default();
            registry.queue_backlog(channel, backlog)
        };
        if start_drain {
            self.deliver_backlog(channel);
        }
        Ok(())
    }

    fn make_background_task_queue(&self, options: TaskQueueOptions) -> TaskQueueToken {
        let queue = self.task_queue_factory.make_background_task_queue(options);
        let kind = queue.kind();
        let token = self.task_queues.register(queue);
        debug!(token = token.id(), queue = %kind, "created background task queue");
        token
    }

    fn enable_buffering_incoming_messages(&self) {
        self.registry().buffered.get_or_insert_with(HashMap::new);
    }

    fn disable_buffering_incoming_messages(&self) {
        let channels: Vec<String> = {
            let mut registry = self.registry();
            let Some(buffered) = registry.buffered.take() else {
                return;
            };
            buffered
                .into_iter()
                .filter_map(|(channel, messages)| {
                    registry.queue_backlog(&channel, messages).then_some(channel)
                })
                .collect()
        };
        // Channels still without a handler drain through the empty-reply path.
        for channel in channels {
            self.deliver_backlog(&channel);
        }
    }
}

impl PlatformMessageHandler for ChannelMessenger {
    fn handle_message_from_engine(
        &self,
        channel: &str,
        message: Option<Vec<u8>>,
        reply_id: ReplyId,
        token: MessageToken,
    ) {
        trace!(channel, reply_id, %token, "message from engine");
        let info = {
            let mut registry = self.registry();
            if let Some(backlog) = registry.draining.get_mut(channel) {
                trace!(channel, reply_id, "backlog still draining; queueing behind it");
                backlog.push_back(BufferedMessage::new(message, reply_id, token));
                return;
            }
            let info = registry.handlers.get(channel).cloned();
            if info.is_none() {
                if let Some(buffered) = registry.buffered.as_mut() {
                    debug!(channel, reply_id, "no handler yet; buffering message");
                    buffered
                        .entry(channel.to_owned())
                        .or_default()
                        .push(BufferedMessage::new(message, reply_id, token));
                    return;
                }
            }
            info
        };
        self.dispatch_message_to_queue(channel, info, message, reply_id, token);
    }

    fn handle_platform_message_response(&self, reply_id: ReplyId, reply: Option<Vec<u8>>) {
        let callback = lock(&self.pending_replies).remove(&reply_id);
        let Some(callback) = callback else {
            trace!(reply_id, "no pending callback for reply");
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(move || callback(reply))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(reply_id, error = ?err, "uncaught error in binary message reply callback");
            }
            Err(payload) => forward_fatal(self.fatal_error_hook.as_ref(), payload),
        }
    }
}

impl Drop for ChannelMessenger {
    fn drop(&mut self) {
        let (buffered, draining) = {
            let mut registry = lock(&self.registry);
            (registry.buffered.take(), std::mem::take(&mut registry.draining))
        };
        let leftover = buffered
            .unwrap_or_default()
            .into_iter()
            .map(|(channel, messages)| (channel, VecDeque::from(messages)))
            .chain(draining);
        for (channel, messages) in leftover {
            for m in messages {
                debug!(%channel, reply_id = m.reply_id, "messenger dropped; answering buffered message");
                self.transport.send_empty_reply(m.reply_id);
                self.transport.release_message_resources(m.token);
            }
        }
    }
}

impl fmt::Debug for ChannelMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("ChannelMessenger")
            .field("channels", &registry.handlers.len())
            .field("buffering", &registry.buffered.is_some())
            .field("pending_replies", &lock(&self.pending_replies).len())
            .field("background_queues", &self.task_queues.len())
            .finish()
    }
}
