//! Named binary channels multiplexed over a single native transport.
//!
//! [`ChannelMessenger`] routes inbound messages to per-channel handlers running on
//! task queues, answers each of them exactly once, releases their transport
//! tokens, and correlates outbound sends with the replies that come back.
//! [`channel`] and [`codec`] layer typed messages and method calls on top.

pub mod channel;
pub mod codec;
pub mod error;
pub mod loopback;
pub mod messenger;
pub mod reply;
pub mod task_queue;
pub mod transport;
mod util;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use channel::{BasicMessageChannel, MessageReply, MethodChannel, MethodResponder, MethodResult};
pub use codec::{
    BinaryCodec, JsonMessageCodec, JsonMethodCodec, MessageCodec, MethodCall, MethodCodec,
    MethodError, StringCodec,
};
pub use error::{ErrorKind, MessengerError};
pub use loopback::{LoopbackPair, LoopbackTransport};
pub use messenger::{
    BinaryMessenger, ChannelMessenger, FatalErrorHook, MessageHandler, MessengerBuilder,
    message_handler,
};
pub use reply::{BinaryReply, ReplyCallback};
pub use task_queue::{QueueKind, TaskQueue, TaskQueueFactory, TaskQueueOptions, TaskQueueToken};
pub use transport::{MessageToken, NativeTransport, PlatformMessageHandler, ReplyId};
