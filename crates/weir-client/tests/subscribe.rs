// Subscription factory behavior against a scripted streaming service:
// binding, creation races, auto-ack, and delivery supervision.
mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use weir_client::{
    AckPolicy, ConsumerConfig, ConsumerInfo, Context, Error, StreamingOptions, SubscribeOptions,
};
use weir_core::Bus;
use weir_wire::{Message, STATUS_CONTROL};

fn push_info(deliver: &str) -> ConsumerInfo {
    ConsumerInfo {
        stream_name: "S".to_string(),
        name: "dur".to_string(),
        config: ConsumerConfig {
            durable_name: Some("dur".to_string()),
            deliver_subject: Some(deliver.to_string()),
            filter_subject: Some("orders.*".to_string()),
            ack_policy: Some(AckPolicy::Explicit),
            ..ConsumerConfig::default()
        },
        push_bound: false,
    }
}

fn bound_opts() -> SubscribeOptions {
    SubscribeOptions {
        stream: Some("S".to_string()),
        consumer: Some("dur".to_string()),
        ..SubscribeOptions::default()
    }
}

fn data_msg(deliver: &str, payload: &str, dseq: u64) -> Message {
    Message::new(deliver, payload.to_string()).with_reply(format!(
        "$JS.ACK.S.dur.1.10.{dseq}.1700000000000000000.0"
    ))
}

fn idle_heartbeat(deliver: &str, last_consumer: u64) -> Message {
    let mut msg = Message::status_message(deliver, STATUS_CONTROL, "Idle Heartbeat");
    msg.headers
        .insert("Nats-Last-Consumer", last_consumer.to_string());
    msg
}

#[tokio::test]
async fn bind_rejects_filter_subject_mismatch() {
    let bus = Bus::new();
    let server = bus.connection();
    let mut info = push_info("deliver.bind");
    info.config.filter_subject = Some("foo".to_string());
    support::serve(&server, "$JS.API.CONSUMER.INFO.S.dur", move |_| {
        Some(support::encode(&info))
    });

    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
    let err = ctx
        .subscribe("bar", bound_opts())
        .await
        .expect_err("filter mismatch");
    assert_eq!(
        err.to_string(),
        "subject 'bar' does not match consumer filter subject 'foo'"
    );
}

#[tokio::test]
async fn queue_subscriptions_reject_heartbeat_and_flow_control_configs() {
    let bus = Bus::new();
    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");

    let err = ctx
        .subscribe(
            "orders.*",
            SubscribeOptions {
                queue: Some("workers".to_string()),
                config: ConsumerConfig {
                    idle_heartbeat: Some(1_000_000_000),
                    ..ConsumerConfig::default()
                },
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect_err("queue with heartbeat");
    assert!(matches!(err, Error::QueueHeartbeat));

    let err = ctx
        .subscribe(
            "orders.*",
            SubscribeOptions {
                queue: Some("workers".to_string()),
                config: ConsumerConfig {
                    flow_control: true,
                    ..ConsumerConfig::default()
                },
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect_err("queue with flow control");
    assert!(matches!(err, Error::QueueFlowControl));
}

#[tokio::test]
async fn pull_subscribe_validates_durable_and_ack_mode() {
    let bus = Bus::new();
    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");

    let err = ctx
        .pull_subscribe("orders.*", "", SubscribeOptions::default())
        .await
        .expect_err("durable required");
    assert!(matches!(err, Error::InvalidArg(_)));

    let err = ctx
        .pull_subscribe(
            "orders.*",
            "puller",
            SubscribeOptions {
                config: ConsumerConfig {
                    ack_policy: Some(AckPolicy::None),
                    ..ConsumerConfig::default()
                },
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect_err("ack none is invalid for pull");
    assert!(err.to_string().contains("invalid ack mode 'none'"));
}

#[tokio::test]
async fn create_race_rebinds_to_existing_consumer() {
    let bus = Bus::new();
    let server = bus.connection();

    let info_calls = Arc::new(AtomicU32::new(0));
    let create_calls = Arc::new(AtomicU32::new(0));
    let (delete_tx, mut delete_rx) = mpsc::unbounded_channel();
    {
        let info_calls = Arc::clone(&info_calls);
        let create_calls = Arc::clone(&create_calls);
        support::serve(&server, "$JS.API.>", move |msg| {
            let subject = msg.subject.as_str();
            if subject == "$JS.API.STREAM.NAMES" {
                return Some(support::encode(&serde_json::json!({"streams": ["S"]})));
            }
            if subject == "$JS.API.CONSUMER.INFO.S.dur" {
                // Both racers see "not found" before either create lands.
                return if info_calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Some(support::api_error(404, 10014, "consumer not found"))
                } else {
                    Some(support::encode(&push_info("deliver.race")))
                };
            }
            if subject == "$JS.API.CONSUMER.DURABLE.CREATE.S.dur" {
                return if create_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Some(support::encode(&push_info("deliver.race")))
                } else {
                    Some(support::api_error(400, 10148, "consumer name already in use"))
                };
            }
            if subject == "$JS.API.CONSUMER.DELETE.S.dur" {
                let _ = delete_tx.send(subject.to_string());
                return Some(support::encode(&serde_json::json!({"success": true})));
            }
            None
        });
    }

    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
    let durable_opts = || SubscribeOptions {
        config: ConsumerConfig {
            durable_name: Some("dur".to_string()),
            ack_policy: Some(AckPolicy::Explicit),
            ..ConsumerConfig::default()
        },
        ..SubscribeOptions::default()
    };

    // The winner creates the consumer and owns it.
    let winner = ctx
        .subscribe("orders.*", durable_opts())
        .await
        .expect("winning subscriber");
    assert_eq!(winner.consumer().as_deref(), Some("dur"));

    // The loser gets "name already in use", re-reads the consumer, and
    // attaches to the same one without owning it.
    let loser = ctx
        .subscribe("orders.*", durable_opts())
        .await
        .expect("losing subscriber rebinds");
    assert_eq!(loser.consumer().as_deref(), Some("dur"));

    loser.unsubscribe().await.expect("loser unsubscribes");
    assert!(delete_rx.try_recv().is_err());

    winner.unsubscribe().await.expect("winner unsubscribes");
    let deleted = timeout(Duration::from_millis(500), delete_rx.recv())
        .await
        .expect("delete observed")
        .expect("delete subject");
    assert_eq!(deleted, "$JS.API.CONSUMER.DELETE.S.dur");
}

#[tokio::test]
async fn handler_subscription_auto_acks_once() {
    let bus = Bus::new();
    let server = bus.connection();

    // The created consumer's deliver subject is whatever inbox the client
    // asked for; capture it from the create request.
    let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel();
    support::serve(&server, "$JS.API.>", move |msg| {
        let subject = msg.subject.as_str();
        if subject == "$JS.API.STREAM.NAMES" {
            return Some(support::encode(&serde_json::json!({"streams": ["S"]})));
        }
        if subject == "$JS.API.CONSUMER.INFO.S.dur" {
            return Some(support::api_error(404, 10014, "consumer not found"));
        }
        if subject == "$JS.API.CONSUMER.DURABLE.CREATE.S.dur" {
            let request: serde_json::Value =
                serde_json::from_slice(&msg.payload).expect("create request");
            let deliver = request["config"]["deliver_subject"]
                .as_str()
                .expect("deliver subject in request")
                .to_string();
            let _ = deliver_tx.send(deliver.clone());
            return Some(support::encode(&push_info(&deliver)));
        }
        None
    });

    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let _sub = ctx
        .subscribe_with(
            "orders.*",
            move |msg| {
                // An explicit ack inside the handler must not double up
                // with the automatic one.
                msg.ack().expect("handler ack");
                let _ = msg_tx.send(msg.into_message());
            },
            SubscribeOptions {
                config: ConsumerConfig {
                    durable_name: Some("dur".to_string()),
                    ack_policy: Some(AckPolicy::Explicit),
                    ..ConsumerConfig::default()
                },
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect("handler subscription");

    let deliver = deliver_rx.recv().await.expect("deliver inbox");
    let mut acks = server.subscribe("$JS.ACK.>").expect("ack tap");

    server
        .publish_msg(data_msg(&deliver, "hello", 1))
        .expect("deliver message");

    let handled = msg_rx.recv().await.expect("handler ran");
    assert_eq!(&handled.payload[..], b"hello");

    let ack = acks.next().await.expect("one ack on the wire");
    assert_eq!(&ack.payload[..], b"+ACK");
    assert!(
        timeout(Duration::from_millis(100), acks.next()).await.is_err(),
        "no second ack for the same message"
    );
}

#[tokio::test]
async fn missed_heartbeats_are_posted_to_the_error_callback() {
    let bus = Bus::new();
    let server = bus.connection();
    let mut info = push_info("deliver.hb");
    info.config.idle_heartbeat = Some(40_000_000); // 40ms
    support::serve(&server, "$JS.API.CONSUMER.INFO.S.dur", move |_| {
        Some(support::encode(&info))
    });

    let conn = bus.connection();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    conn.set_error_callback(move |err| {
        let _ = err_tx.send(err.error);
    });

    let ctx = Context::new(conn, StreamingOptions::default()).expect("context");
    let _sub = ctx
        .subscribe("orders.*", bound_opts())
        .await
        .expect("subscription");

    // No traffic arrives; the watchdog fires after two intervals.
    let posted = timeout(Duration::from_millis(500), err_rx.recv())
        .await
        .expect("watchdog fired")
        .expect("error event");
    assert!(posted.contains("missed heartbeat"));
}

#[tokio::test]
async fn sequence_mismatch_latches_and_resolves() {
    let bus = Bus::new();
    let server = bus.connection();
    support::serve(&server, "$JS.API.CONSUMER.INFO.S.dur", move |_| {
        Some(support::encode(&push_info("deliver.sm")))
    });

    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
    let mut sub = ctx
        .subscribe("orders.*", bound_opts())
        .await
        .expect("subscription");

    server
        .publish_msg(data_msg("deliver.sm", "first", 11))
        .expect("deliver data");
    let first = sub.next().await.expect("next").expect("message");
    let meta = first.metadata().expect("metadata");
    assert_eq!(meta.consumer_sequence, 11);
    assert_eq!(meta.stream_sequence, 10);

    // The server claims it already delivered 12.
    server
        .publish_msg(idle_heartbeat("deliver.sm", 12))
        .expect("deliver heartbeat");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let gap = sub.sequence_mismatch().expect("gap recorded");
    assert_eq!(gap.stream_sequence, 10);
    assert_eq!(gap.consumer_client_sequence, 11);
    assert_eq!(gap.consumer_server_sequence, 12);

    // next() surfaces the latched mismatch exactly once.
    let err = sub.next().await.expect_err("mismatch surfaced");
    assert!(matches!(err, Error::Mismatch));

    // Catching up clears the report.
    server
        .publish_msg(data_msg("deliver.sm", "second", 12))
        .expect("deliver catch-up");
    server
        .publish_msg(idle_heartbeat("deliver.sm", 12))
        .expect("deliver heartbeat");
    let second = sub.next().await.expect("next").expect("message");
    assert_eq!(&second.payload[..], b"second");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(sub.sequence_mismatch(), Err(Error::NotFound)));
}

#[tokio::test]
async fn flow_control_request_is_answered_after_the_queued_messages() {
    let bus = Bus::new();
    let server = bus.connection();
    let mut info = push_info("deliver.fc");
    info.config.flow_control = true;
    support::serve(&server, "$JS.API.CONSUMER.INFO.S.dur", move |_| {
        Some(support::encode(&info))
    });

    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
    let mut sub = ctx
        .subscribe("orders.*", bound_opts())
        .await
        .expect("subscription");

    let mut fc_replies = server.subscribe("fc.resume.1").expect("flow control tap");

    server
        .publish_msg(data_msg("deliver.fc", "one", 1))
        .expect("deliver");
    server
        .publish_msg(data_msg("deliver.fc", "two", 2))
        .expect("deliver");
    server
        .publish_msg(
            Message::status_message("deliver.fc", STATUS_CONTROL, "FlowControl Request")
                .with_reply("fc.resume.1"),
        )
        .expect("deliver flow control");

    assert!(sub.next().await.expect("next").is_some());
    assert!(sub.next().await.expect("next").is_some());

    let resume = timeout(Duration::from_millis(500), fc_replies.next())
        .await
        .expect("flow control answered")
        .expect("resume message");
    assert!(resume.payload.is_empty());
}
