use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use binmux::config::{EnvConfigSource, KEY_BACKGROUND_QUEUE_SERIAL, MapConfigSource, MessengerSettings};
use binmux::demo::{PING_CHANNEL, install_engine_handlers, run_loopback};
use channel_messenger::test_util::{RecordingTransport, TransportEvent};
use channel_messenger::{
    BinaryMessenger, ChannelMessenger, LoopbackPair, MessageToken, PlatformMessageHandler,
    TaskQueueOptions, message_handler,
};
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_drained(pair: &LoopbackPair) {
    timeout(WAIT, async {
        while pair.pending_reply_count() != 0 || pair.outstanding_message_count() != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loopback pair did not drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loopback_run_is_clean() {
    let report = run_loopback(&MessengerSettings::default(), 25).await.unwrap();

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.pongs_received, 25);
    assert_eq!(report.upper, "success: \"BINMUX\"");
    assert_eq!(report.unknown_method, "not implemented");
    assert!(report.rejected_call.starts_with("error: method error `error`"), "{}", report.rejected_call);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loopback_run_with_concurrent_background_queue() {
    let source = MapConfigSource::new().with(KEY_BACKGROUND_QUEUE_SERIAL, "false");
    let settings = MessengerSettings::load(&source).await.unwrap();
    let report = run_loopback(&settings, 10).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_callers_each_get_their_own_reply() {
    let pair = Arc::new(LoopbackPair::connect().unwrap());
    let settings = MessengerSettings::default();
    let _text = install_engine_handlers(&pair, &settings).unwrap();

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let pair = pair.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let payload = format!("{caller}-{i}");
                let reply = pair
                    .platform
                    .call(PING_CHANNEL, Some(payload.clone().into_bytes()))
                    .await
                    .unwrap();
                assert_eq!(reply, Some(format!("pong {payload}").into_bytes()));
            }
        }));
    }
    for task in tasks {
        timeout(WAIT, task).await.unwrap().unwrap();
    }
    wait_drained(&pair).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn buffered_sends_are_delivered_in_order_once_registered() {
    let pair = LoopbackPair::connect_with(|builder| builder.buffer_incoming(true)).unwrap();

    let (tx, mut replies) = tokio::sync::mpsc::unbounded_channel();
    for i in 0..10u8 {
        let tx = tx.clone();
        pair.platform.send(
            "late",
            Some(vec![i]),
            Some(Box::new(move |reply| {
                tx.send(reply)?;
                Ok(())
            })),
        );
    }
    // Every send has reached the engine and is parked there.
    timeout(WAIT, async {
        while pair.engine_transport.outstanding_message_count() != 10 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let queue = pair.engine.make_background_task_queue(TaskQueueOptions::default());
    pair.engine
        .set_message_handler(
            "late",
            Some(message_handler(move |message, reply| {
                let message = message.ok_or_else(|| anyhow!("empty"))?;
                sink.lock().unwrap().push(message[0]);
                reply.reply(Some(message))?;
                Ok(())
            })),
            Some(&queue),
        )
        .unwrap();

    for i in 0..10u8 {
        let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply, Some(vec![i]));
    }
    assert_eq!(*seen.lock().unwrap(), (0..10u8).collect::<Vec<_>>());
    wait_drained(&pair).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settings_from_env_file_shape_the_pair() {
    let dir = tempdir().unwrap();
    let env_file = dir.path().join("binmux.env");
    std::fs::write(&env_file, "BINMUX_TEST_ONLY_INTEGRATION_MARKER=1\n").unwrap();

    let source = EnvConfigSource::new(Some(env_file));
    let settings = MessengerSettings::load(&source).await.unwrap();
    let pair = LoopbackPair::connect_with(|builder| settings.apply(builder).buffer_incoming(true)).unwrap();

    // With buffering on, an unhandled channel stays unanswered until buffering stops.
    let platform = pair.platform.clone();
    let pending = tokio::spawn(async move { platform.call("nobody", None).await });
    timeout(WAIT, async {
        while pair.engine_transport.outstanding_message_count() != 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    pair.engine.disable_buffering_incoming_messages();

    assert_eq!(timeout(WAIT, pending).await.unwrap().unwrap().unwrap(), None);
    wait_drained(&pair).await;
}

/// Handlers that reply, fail, panic, or forget to reply: every message is still
/// answered once and released once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_message_is_answered_and_released_exactly_once() {
    let transport = RecordingTransport::new();
    let panics = Arc::new(AtomicUsize::new(0));
    let seen_panics = panics.clone();
    let messenger = ChannelMessenger::builder(transport.clone())
        .fatal_error_hook(move |_payload| {
            seen_panics.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let serial = messenger.make_background_task_queue(TaskQueueOptions::default());
    let concurrent = messenger.make_background_task_queue(TaskQueueOptions::new().serial(false));
    messenger
        .set_message_handler(
            "mixed",
            Some(message_handler(|message, reply| {
                match message.unwrap_or_default().first().copied().unwrap_or(0) % 4 {
                    0 => reply.reply(Some(b"ok".to_vec()))?,
                    1 => return Err(anyhow!("handler failed")),
                    2 => panic!("handler panicked"),
                    _ => {}
                }
                Ok(())
            })),
            Some(&serial),
        )
        .unwrap();
    messenger
        .set_message_handler(
            "mixed-concurrent",
            Some(message_handler(|_message, reply| {
                reply.reply(None)?;
                Ok(())
            })),
            Some(&concurrent),
        )
        .unwrap();

    let total = 100i64;
    for id in 0..total {
        let channel = if id % 5 == 0 { "mixed-concurrent" } else { "mixed" };
        messenger.handle_message_from_engine(channel, Some(vec![id as u8]), id, MessageToken(id as u64));
    }
    messenger.handle_message_from_engine("unhandled", None, total, MessageToken(total as u64));

    let done = transport
        .wait_until(WAIT, |events| {
            events.iter().filter(|e| matches!(e, TransportEvent::Released(_))).count() == (total + 1) as usize
        })
        .await;
    assert!(done);

    let mut replies: HashMap<i64, usize> = HashMap::new();
    let mut releases: HashMap<u64, usize> = HashMap::new();
    for event in transport.events() {
        match event {
            TransportEvent::ReplyBytes { reply_id, .. } | TransportEvent::EmptyReply { reply_id } => {
                *replies.entry(reply_id).or_default() += 1;
            }
            TransportEvent::Released(token) => *releases.entry(token.0).or_default() += 1,
            other => panic!("unexpected transport call {other:?}"),
        }
    }
    assert_eq!(replies.len(), (total + 1) as usize);
    assert!(replies.values().all(|&n| n == 1), "{replies:?}");
    assert_eq!(releases.len(), (total + 1) as usize);
    assert!(releases.values().all(|&n| n == 1), "{releases:?}");

    let expected_panics = (0..total).filter(|id| id % 5 != 0 && id % 4 == 2).count();
    assert_eq!(panics.load(Ordering::SeqCst), expected_panics);
}
