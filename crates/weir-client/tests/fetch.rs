// Pull fetch against a scripted streaming service: the no_wait probe, the
// local drain, status tolerance, and ack delivery.
mod support;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use weir_client::{
    AckPolicy, ConsumerConfig, ConsumerInfo, Context, Error, StreamingOptions, SubscribeOptions,
};
use weir_core::{Bus, Connection};
use weir_wire::{Message, STATUS_NOT_FOUND, STATUS_REQUEST_TIMEOUT};

const NEXT_SUBJECT: &str = "$JS.API.CONSUMER.MSG.NEXT.S.puller";

fn pull_info() -> ConsumerInfo {
    ConsumerInfo {
        stream_name: "S".to_string(),
        name: "puller".to_string(),
        config: ConsumerConfig {
            durable_name: Some("puller".to_string()),
            filter_subject: Some("orders.*".to_string()),
            ack_policy: Some(AckPolicy::Explicit),
            ..ConsumerConfig::default()
        },
        push_bound: false,
    }
}

fn data_msg(inbox: &str, payload: &str, dseq: u64) -> Message {
    Message::new(inbox, payload.to_string()).with_reply(format!(
        "$JS.ACK.S.puller.1.{dseq}.{dseq}.1700000000000000000.0"
    ))
}

/// Stand up a bound pull subscription and a channel of incoming pull
/// requests.
async fn pull_fixture(
    bus: &Bus,
) -> (
    Connection,
    weir_client::PullSubscription,
    mpsc::UnboundedReceiver<Message>,
) {
    let server = bus.connection();
    support::serve(&server, "$JS.API.CONSUMER.INFO.S.puller", move |_| {
        Some(support::encode(&pull_info()))
    });
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    support::serve(&server, NEXT_SUBJECT, move |msg| {
        let _ = req_tx.send(msg.clone());
        None
    });

    let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
    let sub = ctx
        .pull_subscribe(
            "orders.*",
            "puller",
            SubscribeOptions {
                stream: Some("S".to_string()),
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect("pull subscription");
    (server, sub, req_rx)
}

#[tokio::test]
async fn fetch_validates_arguments() {
    let bus = Bus::new();
    let (_server, mut sub, _reqs) = pull_fixture(&bus).await;
    assert!(matches!(
        sub.fetch(0, Duration::from_millis(100)).await,
        Err(Error::InvalidArg(_))
    ));
    assert!(matches!(
        sub.fetch(1, Duration::ZERO).await,
        Err(Error::InvalidTimeout)
    ));
}

#[tokio::test]
async fn no_wait_probe_flips_to_blocking_on_404() {
    let bus = Bus::new();
    let (server, mut sub, mut reqs) = pull_fixture(&bus).await;

    let driver = tokio::spawn(async move {
        // First request probes with no_wait for the full batch.
        let first = reqs.recv().await.expect("first pull request");
        let body: serde_json::Value =
            serde_json::from_slice(&first.payload).expect("request body");
        assert_eq!(body["batch"], 5);
        assert_eq!(body["no_wait"], true);
        assert!(body["expires"].as_i64().expect("expires") > 0);
        let inbox = first.reply.clone().expect("request reply");
        server
            .publish_msg(Message::status_message(&inbox, STATUS_NOT_FOUND, "No Messages"))
            .expect("404");

        // The retry parks server-side: no no_wait this time.
        let second = reqs.recv().await.expect("second pull request");
        let body: serde_json::Value =
            serde_json::from_slice(&second.payload).expect("request body");
        assert!(body.get("no_wait").is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        server
            .publish_msg(data_msg(&inbox, "late", 1))
            .expect("deliver one message");
    });

    let msgs = sub
        .fetch(5, Duration::from_millis(1000))
        .await
        .expect("partial batch");
    assert_eq!(msgs.len(), 1);
    assert_eq!(&msgs[0].payload[..], b"late");
    driver.await.expect("driver");
}

#[tokio::test]
async fn queued_messages_are_drained_before_requesting_more() {
    let bus = Bus::new();
    let (server, mut sub, mut reqs) = pull_fixture(&bus).await;

    // The service over-delivers on the first round.
    let driver = tokio::spawn(async move {
        let first = reqs.recv().await.expect("first pull request");
        let inbox = first.reply.clone().expect("request reply");
        for (i, payload) in ["a", "b", "c"].iter().enumerate() {
            server
                .publish_msg(data_msg(&inbox, payload, i as u64 + 1))
                .expect("deliver");
        }
        // No further request may arrive.
        assert!(
            timeout(Duration::from_millis(300), reqs.recv()).await.is_err(),
            "second batch was served locally"
        );
    });

    let msgs = sub.fetch(1, Duration::from_millis(500)).await.expect("first batch");
    assert_eq!(msgs.len(), 1);

    // Two messages still sit in the inbox; the next fetch never talks to
    // the service.
    let msgs = sub.fetch(2, Duration::from_millis(500)).await.expect("local drain");
    assert_eq!(msgs.len(), 2);
    assert_eq!(&msgs[0].payload[..], b"b");
    assert_eq!(&msgs[1].payload[..], b"c");
    driver.await.expect("driver");
}

#[tokio::test]
async fn request_timeout_status_is_ignored() {
    let bus = Bus::new();
    let (server, mut sub, mut reqs) = pull_fixture(&bus).await;

    let driver = tokio::spawn(async move {
        let first = reqs.recv().await.expect("pull request");
        let inbox = first.reply.clone().expect("request reply");
        server
            .publish_msg(Message::status_message(
                &inbox,
                STATUS_REQUEST_TIMEOUT,
                "Request Timeout",
            ))
            .expect("408");
        server
            .publish_msg(data_msg(&inbox, "still-coming", 1))
            .expect("deliver");
    });

    let msgs = sub.fetch(1, Duration::from_millis(500)).await.expect("batch");
    assert_eq!(msgs.len(), 1);
    assert_eq!(&msgs[0].payload[..], b"still-coming");
    driver.await.expect("driver");
}

#[tokio::test]
async fn partial_batch_beats_the_timeout() {
    let bus = Bus::new();
    let (server, mut sub, mut reqs) = pull_fixture(&bus).await;

    let driver = tokio::spawn(async move {
        let first = reqs.recv().await.expect("pull request");
        let inbox = first.reply.clone().expect("request reply");
        server
            .publish_msg(data_msg(&inbox, "only-one", 1))
            .expect("deliver");
    });

    let msgs = sub
        .fetch(3, Duration::from_millis(200))
        .await
        .expect("partial batch despite timeout");
    assert_eq!(msgs.len(), 1);
    driver.await.expect("driver");
}

#[tokio::test]
async fn empty_fetch_times_out() {
    let bus = Bus::new();
    let (_server, mut sub, _reqs) = pull_fixture(&bus).await;
    let err = sub
        .fetch(1, Duration::from_millis(100))
        .await
        .expect_err("nothing arrives");
    assert!(matches!(err, Error::Timeout));
}

#[tokio::test]
async fn acks_are_published_at_most_once() {
    let bus = Bus::new();
    let (server, mut sub, mut reqs) = pull_fixture(&bus).await;
    let mut acks = server.subscribe("$JS.ACK.>").expect("ack tap");

    let driver = {
        let server = server.clone();
        tokio::spawn(async move {
            let first = reqs.recv().await.expect("pull request");
            let inbox = first.reply.clone().expect("request reply");
            server
                .publish_msg(data_msg(&inbox, "work", 4))
                .expect("deliver");
        })
    };

    let msgs = sub.fetch(1, Duration::from_millis(500)).await.expect("batch");
    let msg = &msgs[0];

    // Progress does not consume the ack; the final ack does, exactly once.
    msg.in_progress().expect("in progress");
    msg.ack().expect("ack");
    msg.ack().expect("repeated ack is a no-op");
    msg.nak().expect("nak after ack is a no-op");

    let wip = acks.next().await.expect("work-in-progress on the wire");
    assert_eq!(&wip.payload[..], b"+WPI");
    let ack = acks.next().await.expect("ack on the wire");
    assert_eq!(&ack.payload[..], b"+ACK");
    assert!(
        timeout(Duration::from_millis(100), acks.next()).await.is_err(),
        "no further acks"
    );
    driver.await.expect("driver");
}
