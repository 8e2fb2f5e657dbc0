//! End-to-end exercise of a loopback pair: pings on a background queue and a
//! method channel, then a check that every reply and token drained.

use std::time::Duration;

use anyhow::{Context, anyhow};
use channel_messenger::{
    BinaryMessenger, LoopbackPair, MethodChannel, MethodResult, message_handler,
};
use serde::Serialize;
use serde_json::json;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::MessengerSettings;

pub const PING_CHANNEL: &str = "ping";
pub const TEXT_CHANNEL: &str = "text";

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pings_sent: usize,
    pub pongs_received: usize,
    pub upper: String,
    pub unknown_method: String,
    pub rejected_call: String,
    pub pending_replies: usize,
    pub outstanding_messages: usize,
}

impl RunReport {
    /// Every ping answered, nothing left waiting on either side.
    pub fn is_clean(&self) -> bool {
        self.pings_sent == self.pongs_received
            && self.pending_replies == 0
            && self.outstanding_messages == 0
    }
}

fn describe(result: &MethodResult) -> String {
    match result {
        MethodResult::Success(value) => format!("success: {value}"),
        MethodResult::Error(error) => format!("error: {error}"),
        MethodResult::NotImplemented => "not implemented".to_string(),
    }
}

/// Wire the engine side of `pair`: `ping` on a background queue and the `text`
/// method channel on the platform queue.
pub fn install_engine_handlers(pair: &LoopbackPair, settings: &MessengerSettings) -> anyhow::Result<MethodChannel> {
    let queue = pair.engine.make_background_task_queue(settings.queue_options());
    pair.engine.set_message_handler(
        PING_CHANNEL,
        Some(message_handler(|message, reply| {
            let mut pong = b"pong ".to_vec();
            pong.extend(message.unwrap_or_default());
            reply.reply(Some(pong))?;
            Ok(())
        })),
        Some(&queue),
    )?;

    let text = MethodChannel::new(pair.engine.clone(), TEXT_CHANNEL);
    text.set_method_call_handler(|call, responder| match call.method.as_str() {
        "upper" => {
            let text = call
                .arguments
                .as_str()
                .ok_or_else(|| anyhow!("`upper` expects a string argument"))?;
            responder.success(json!(text.to_uppercase()))?;
            Ok(())
        }
        "length" => {
            let text = call.arguments.as_str().unwrap_or_default();
            responder.success(json!(text.chars().count()))?;
            Ok(())
        }
        _ => Ok(responder.not_implemented()?),
    })?;
    Ok(text)
}

pub async fn run_loopback(settings: &MessengerSettings, count: usize) -> anyhow::Result<RunReport> {
    let pair = LoopbackPair::connect_with(|builder| settings.apply(builder))?;
    let _text = install_engine_handlers(&pair, settings)?;
    info!(count, "loopback pair connected");

    let mut pongs_received = 0;
    for i in 0..count {
        let payload = i.to_string().into_bytes();
        let reply = timeout(REPLY_TIMEOUT, pair.platform.call(PING_CHANNEL, Some(payload)))
            .await
            .with_context(|| format!("ping {i} timed out"))??;
        let expected = format!("pong {i}");
        if reply.as_deref() == Some(expected.as_bytes()) {
            pongs_received += 1;
        } else {
            warn!(i, ?reply, "unexpected ping reply");
        }
    }
    debug!(pongs_received, "pings done");

    let text = MethodChannel::new(pair.platform.clone(), TEXT_CHANNEL);
    let upper = timeout(REPLY_TIMEOUT, text.invoke("upper", json!("binmux"))).await??;
    let unknown_method = timeout(REPLY_TIMEOUT, text.invoke("reverse", json!("binmux"))).await??;
    let rejected_call = timeout(REPLY_TIMEOUT, text.invoke("upper", json!(42))).await??;

    // Tokens are released just after the reply goes out.
    let drained = timeout(DRAIN_TIMEOUT, async {
        while pair.pending_reply_count() != 0 || pair.outstanding_message_count() != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            pending = pair.pending_reply_count(),
            outstanding = pair.outstanding_message_count(),
            "loopback pair did not drain"
        );
    }

    Ok(RunReport {
        pings_sent: count,
        pongs_received,
        upper: describe(&upper),
        unknown_method: describe(&unknown_method),
        rejected_call: describe(&rejected_call),
        pending_replies: pair.pending_reply_count(),
        outstanding_messages: pair.outstanding_message_count(),
    })
}
