//! Typed channels over a [`BinaryMessenger`].

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::codec::{JsonMethodCodec, MessageCodec, MethodCall, MethodCodec, MethodError};
use crate::error::{ErrorKind, MessengerError};
use crate::messenger::{BinaryMessenger, message_handler};
use crate::reply::{BinaryReply, ReplyCallback};
use crate::task_queue::TaskQueueToken;

/// Reply handle for a [`BasicMessageChannel`] handler.
pub struct MessageReply<T> {
    codec: Arc<dyn MessageCodec<T>>,
    reply: BinaryReply,
}

impl<T> MessageReply<T> {
    pub fn reply(&self, message: Option<&T>) -> Result<(), MessengerError> {
        let bytes = self.codec.encode_message(message)?;
        self.reply.reply(bytes)
    }
}

/// A named channel exchanging values of `T` through a [`MessageCodec`].
pub struct BasicMessageChannel<T> {
    messenger: Arc<dyn BinaryMessenger>,
    name: String,
    codec: Arc<dyn MessageCodec<T>>,
    task_queue: Option<TaskQueueToken>,
}

impl<T: Send + 'static> BasicMessageChannel<T> {
    pub fn new<C>(messenger: Arc<dyn BinaryMessenger>, name: impl Into<String>, codec: C) -> Self
    where
        C: MessageCodec<T> + 'static,
    {
        Self {
            messenger,
            name: name.into(),
            codec: Arc::new(codec),
            task_queue: None,
        }
    }

    /// Run this channel's handler on a background queue.
    pub fn with_task_queue(mut self, token: TaskQueueToken) -> Self {
        self.task_queue = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A reply that fails to decode is logged and the callback is not run.
    pub fn send<F>(&self, message: Option<&T>, callback: Option<F>) -> Result<(), MessengerError>
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        let bytes = self.codec.encode_message(message)?;
        let callback = callback.map(|callback| {
            let codec = Arc::clone(&self.codec);
            Box::new(move |reply: Option<Vec<u8>>| -> anyhow::Result<()> {
                callback(codec.decode_message(reply.as_deref())?);
                Ok(())
            }) as ReplyCallback
        });
        self.messenger.send(&self.name, bytes, callback);
        Ok(())
    }

    /// An undecodable message is answered empty without reaching `handler`.
    pub fn set_message_handler<F>(&self, handler: F) -> Result<(), MessengerError>
    where
        F: Fn(Option<T>, MessageReply<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let codec = Arc::clone(&self.codec);
        let wrapped = message_handler(move |message, reply| {
            let message = codec.decode_message(message.as_deref())?;
            handler(
                message,
                MessageReply {
                    codec: Arc::clone(&codec),
                    reply,
                },
            )
        });
        self.messenger
            .set_message_handler(&self.name, Some(wrapped), self.task_queue.as_ref())
    }

    pub fn clear_message_handler(&self) -> Result<(), MessengerError> {
        self.messenger.set_message_handler(&self.name, None, None)
    }
}

/// Outcome of a method invocation as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResult {
    Success(Value),
    Error(MethodError),
    /// The other side has no handler for the channel, or declined the method.
    NotImplemented,
}

pub type MethodResultCallback = Box<dyn FnOnce(Result<MethodResult, MessengerError>) + Send + 'static>;

/// Single-use responder handed to a method call handler. Clones share the reply.
#[derive(Clone)]
pub struct MethodResponder {
    codec: Arc<dyn MethodCodec>,
    reply: Arc<BinaryReply>,
}

impl MethodResponder {
    pub fn success(&self, result: Value) -> Result<(), MessengerError> {
        let envelope = self.codec.encode_success_envelope(&result)?;
        self.reply.reply(Some(envelope))
    }

    pub fn error(&self, error: MethodError) -> Result<(), MessengerError> {
        let envelope = self.codec.encode_error_envelope(&error)?;
        self.reply.reply(Some(envelope))
    }

    pub fn not_implemented(&self) -> Result<(), MessengerError> {
        self.reply.reply(None)
    }
}

/// A named channel carrying method calls and their results.
pub struct MethodChannel {
    messenger: Arc<dyn BinaryMessenger>,
    name: String,
    codec: Arc<dyn MethodCodec>,
    task_queue: Option<TaskQueueToken>,
}

impl MethodChannel {
    /// A channel using [`JsonMethodCodec`].
    pub fn new(messenger: Arc<dyn BinaryMessenger>, name: impl Into<String>) -> Self {
        Self::with_codec(messenger, name, JsonMethodCodec)
    }

    pub fn with_codec<C>(messenger: Arc<dyn BinaryMessenger>, name: impl Into<String>, codec: C) -> Self
    where
        C: MethodCodec + 'static,
    {
        Self {
            messenger,
            name: name.into(),
            codec: Arc::new(codec),
            task_queue: None,
        }
    }

    pub fn with_task_queue(mut self, token: TaskQueueToken) -> Self {
        self.task_queue = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke_method(
        &self,
        method: &str,
        arguments: Value,
        callback: Option<MethodResultCallback>,
    ) -> Result<(), MessengerError> {
        let bytes = self
            .codec
            .encode_method_call(&MethodCall::new(method, arguments))?;
        let callback = callback.map(|callback| {
            let codec = Arc::clone(&self.codec);
            Box::new(move |reply: Option<Vec<u8>>| -> anyhow::Result<()> {
                let result = match reply {
                    None => Ok(MethodResult::NotImplemented),
                    Some(envelope) => codec.decode_envelope(&envelope).map(|outcome| match outcome {
                        Ok(value) => MethodResult::Success(value),
                        Err(error) => MethodResult::Error(error),
                    }),
                };
                callback(result);
                Ok(())
            }) as ReplyCallback
        });
        self.messenger.send(&self.name, Some(bytes), callback);
        Ok(())
    }

    /// [`invoke_method`](Self::invoke_method), awaited. Waits as long as the other
    /// side takes to answer.
    pub async fn invoke(&self, method: &str, arguments: Value) -> Result<MethodResult, MessengerError> {
        let (tx, rx) = oneshot::channel();
        self.invoke_method(
            method,
            arguments,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        rx.await
            .map_err(|_| MessengerError::ReplyDropped(self.name.clone()))?
    }

    /// A handler returning `Err` is answered with an `"error"` envelope carrying
    /// the error text, unless it already responded.
    pub fn set_method_call_handler<F>(&self, handler: F) -> Result<(), MessengerError>
    where
        F: Fn(MethodCall, MethodResponder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let codec = Arc::clone(&self.codec);
        let channel = self.name.clone();
        let wrapped = message_handler(move |message, reply| {
            let call = match message.as_deref().map(|bytes| codec.decode_method_call(bytes)) {
                Some(Ok(call)) => call,
                Some(Err(err)) => {
                    warn!(channel = %channel, error = %err, "undecodable method call");
                    reply.reply(None)?;
                    return Ok(());
                }
                None => {
                    warn!(channel = %channel, "method call without payload");
                    reply.reply(None)?;
                    return Ok(());
                }
            };

            let responder = MethodResponder {
                codec: Arc::clone(&codec),
                reply: Arc::new(reply),
            };
            let method = call.method.clone();
            if let Err(err) = handler(call, responder.clone()) {
                error!(channel = %channel, method = %method, error = ?err, "method call handler failed");
                let failure = MethodError::new("error").with_message(err.to_string());
                match responder.error(failure) {
                    Err(e) if e.kind() == ErrorKind::IllegalState => {}
                    other => other?,
                }
            }
            Ok(())
        });
        self.messenger
            .set_message_handler(&self.name, Some(wrapped), self.task_queue.as_ref())
    }

    pub fn clear_method_call_handler(&self) -> Result<(), MessengerError> {
        self.messenger.set_message_handler(&self.name, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonMessageCodec, StringCodec};
    use crate::loopback::LoopbackPair;
    use crate::task_queue::TaskQueueOptions;
    use anyhow::{anyhow, bail};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn text_channel(pair: &LoopbackPair) -> (MethodChannel, MethodChannel) {
        let engine = MethodChannel::new(pair.engine.clone(), "text");
        let platform = MethodChannel::new(pair.platform.clone(), "text");
        engine
            .set_method_call_handler(|call, responder| match call.method.as_str() {
                "upper" => {
                    let Some(text) = call.arguments.as_str() else {
                        responder.error(MethodError::new("bad_args").with_message("expected a string"))?;
                        return Ok(());
                    };
                    responder.success(json!(text.to_uppercase()))?;
                    Ok(())
                }
                "explode" => bail!("exploded on purpose"),
                _ => Ok(responder.not_implemented()?),
            })
            .unwrap();
        (engine, platform)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn method_results_cover_every_outcome() {
        let pair = LoopbackPair::connect().unwrap();
        let (_engine, platform) = text_channel(&pair);

        let ok = timeout(WAIT, platform.invoke("upper", json!("abc"))).await.unwrap().unwrap();
        assert_eq!(ok, MethodResult::Success(json!("ABC")));

        let bad = timeout(WAIT, platform.invoke("upper", json!(3))).await.unwrap().unwrap();
        assert_eq!(
            bad,
            MethodResult::Error(MethodError::new("bad_args").with_message("expected a string"))
        );

        let missing = timeout(WAIT, platform.invoke("reverse", Value::Null)).await.unwrap().unwrap();
        assert_eq!(missing, MethodResult::NotImplemented);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_errors_become_error_envelopes() {
        let pair = LoopbackPair::connect().unwrap();
        let (_engine, platform) = text_channel(&pair);

        let result = timeout(WAIT, platform.invoke("explode", Value::Null)).await.unwrap().unwrap();
        let MethodResult::Error(error) = result else {
            panic!("expected an error envelope, got {result:?}");
        };
        assert_eq!(error.code, "error");
        assert_eq!(error.message.as_deref(), Some("exploded on purpose"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn method_channel_without_handler_is_not_implemented() {
        let pair = LoopbackPair::connect().unwrap();
        let platform = MethodChannel::new(pair.platform.clone(), "nobody");
        let result = timeout(WAIT, platform.invoke("anything", Value::Null)).await.unwrap().unwrap();
        assert_eq!(result, MethodResult::NotImplemented);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecodable_method_calls_are_answered_empty() {
        let pair = LoopbackPair::connect().unwrap();
        let (_engine, _platform) = text_channel(&pair);

        let reply = timeout(WAIT, pair.platform.call("text", Some(b"not json".to_vec())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn basic_channel_round_trips_strings_on_a_background_queue() {
        let pair = LoopbackPair::connect().unwrap();
        let queue = pair.engine.make_background_task_queue(TaskQueueOptions::default());
        let engine = BasicMessageChannel::<String>::new(pair.engine.clone(), "greet", StringCodec).with_task_queue(queue);
        engine
            .set_message_handler(|message, reply| {
                let name = message.ok_or_else(|| anyhow!("no name"))?;
                reply.reply(Some(&format!("hello, {name}")))?;
                Ok(())
            })
            .unwrap();

        let platform = BasicMessageChannel::<String>::new(pair.platform.clone(), "greet", StringCodec);
        let (tx, rx) = oneshot::channel();
        platform
            .send(
                Some(&"ada".to_string()),
                Some(move |reply: Option<String>| {
                    let _ = tx.send(reply);
                }),
            )
            .unwrap();
        assert_eq!(timeout(WAIT, rx).await.unwrap().unwrap().as_deref(), Some("hello, ada"));

        // Handler error: empty reply.
        let (tx, rx) = oneshot::channel();
        platform
            .send(None, Some(move |reply: Option<String>| {
                let _ = tx.send(reply);
            }))
            .unwrap();
        assert_eq!(timeout(WAIT, rx).await.unwrap().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn basic_channel_without_callback_is_fire_and_forget() {
        let pair = LoopbackPair::connect().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let engine = BasicMessageChannel::<Value>::new(pair.engine.clone(), "events", JsonMessageCodec);
        engine
            .set_message_handler(move |message, _reply| {
                tx.send(message)?;
                Ok(())
            })
            .unwrap();

        let platform = BasicMessageChannel::<Value>::new(pair.platform.clone(), "events", JsonMessageCodec);
        platform
            .send(Some(&json!({"kind": "tick"})), None::<fn(Option<Value>)>)
            .unwrap();

        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, Some(json!({"kind": "tick"})));
        assert_eq!(pair.pending_reply_count(), 0);

        engine.clear_message_handler().unwrap();
        let reply = timeout(WAIT, pair.platform.call("events", None)).await.unwrap().unwrap();
        assert_eq!(reply, None);
    }
}
