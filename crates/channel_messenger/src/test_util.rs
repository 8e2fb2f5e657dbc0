//! Transport double that records every outbound call.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::transport::{MessageToken, NativeTransport, ReplyId};
use crate::util::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DispatchMessage { channel: String, message: Vec<u8>, reply_id: ReplyId },
    DispatchEmptyMessage { channel: String, reply_id: ReplyId },
    ReplyBytes { reply_id: ReplyId, reply: Vec<u8> },
    EmptyReply { reply_id: ReplyId },
    Released(MessageToken),
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        lock(&self.events).clone()
    }

    /// Every answer sent for `reply_id`, `None` standing for an empty reply.
    pub fn replies_for(&self, reply_id: ReplyId) -> Vec<Option<Vec<u8>>> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                TransportEvent::ReplyBytes { reply_id: id, reply } if *id == reply_id => {
                    Some(Some(reply.clone()))
                }
                TransportEvent::EmptyReply { reply_id: id } if *id == reply_id => Some(None),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<MessageToken> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Released(token) => Some(*token),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds for the recorded events or `within` elapses.
    pub async fn wait_until<F>(&self, within: Duration, pred: F) -> bool
    where
        F: Fn(&[TransportEvent]) -> bool,
    {
        let deadline = Instant::now() + within;
        loop {
            let satisfied = pred(&lock(&self.events));
            if satisfied {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, event: TransportEvent) {
        lock(&self.events).push(event);
    }
}

impl NativeTransport for RecordingTransport {
    fn dispatch_message(&self, channel: &str, message: Vec<u8>, reply_id: ReplyId) {
        self.record(TransportEvent::DispatchMessage {
            channel: channel.to_owned(),
            message,
            reply_id,
        });
    }

    fn dispatch_empty_message(&self, channel: &str, reply_id: ReplyId) {
        self.record(TransportEvent::DispatchEmptyMessage {
            channel: channel.to_owned(),
            reply_id,
        });
    }

    fn send_reply_bytes(&self, reply_id: ReplyId, reply: Vec<u8>) {
        self.record(TransportEvent::ReplyBytes { reply_id, reply });
    }

    fn send_empty_reply(&self, reply_id: ReplyId) {
        self.record(TransportEvent::EmptyReply { reply_id });
    }

    fn release_message_resources(&self, token: MessageToken) {
        self.record(TransportEvent::Released(token));
    }
}
