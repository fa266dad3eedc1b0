//! Synchronous publish and the asynchronous publish tracker.
//!
//! # Purpose
//! An asynchronous publish hands the message to the library and correlates
//! the service's acknowledgment out of band: each message is published with
//! a unique reply subject under a per-context inbox prefix, and a single
//! wildcard subscription demultiplexes the acks back to the pending entry.
//!
//! # Design notes
//! The pending map, its counters, and the reply subscription are created
//! lazily on the first asynchronous publish. Backpressure is a counted cap:
//! a publish over the cap waits on the context's notifier until acks bring
//! the count down or the stall deadline passes.
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use weir_core::Subscription;
use weir_wire::Message;

use crate::api;
use crate::config::PublishOptions;
use crate::context::{Context, ContextInner};
use crate::error::{Error, Result};

pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
pub const EXPECTED_STREAM_HEADER: &str = "Nats-Expected-Stream";
pub const EXPECTED_LAST_MSG_ID_HEADER: &str = "Nats-Expected-Last-Msg-Id";
pub const EXPECTED_LAST_SEQUENCE_HEADER: &str = "Nats-Expected-Last-Sequence";
pub const EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER: &str = "Nats-Expected-Last-Subject-Sequence";

pub(crate) const REPLY_TOKEN_LEN: usize = 8;

/// Acknowledgment returned by the service for a stored message.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct PubAck {
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A failed asynchronous publish. The message travels with the error so the
/// caller (or the configured error handler) can republish it.
#[derive(Debug)]
pub struct PublishError {
    pub message: Message,
    pub error: Error,
}

impl PublishError {
    pub(crate) fn new(message: Message, error: Error) -> Self {
        Self { message, error }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publish of '{}' failed: {}", self.message.subject, self.error)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub(crate) struct Tracker {
    reply_prefix: String,
    pending: HashMap<String, Message>,
    /// Outstanding publishes, including registrations whose map entry has
    /// not landed yet. Equal to the map size at rest.
    pub(crate) pmcount: usize,
    /// Publishers currently waiting out a stall.
    stalled: usize,
    /// Callers waiting in `publish_async_complete`.
    pacw: usize,
    demux: JoinHandle<()>,
}

impl Tracker {
    pub(crate) fn stop(self) {
        // Aborting the demux task drops its reply subscription; undelivered
        // user messages go down with the pending map.
        self.demux.abort();
    }
}

fn build_tracker(inner: &Arc<ContextInner>) -> Result<Tracker> {
    let reply_prefix = format!(
        "{}{}.",
        weir_core::INBOX_PREFIX,
        weir_core::base62_token(REPLY_TOKEN_LEN)
    );
    let sub = inner.conn.subscribe(&format!("{reply_prefix}*"))?;
    let demux = tokio::spawn(run_reply_demux(Arc::clone(inner), sub));
    Ok(Tracker {
        reply_prefix,
        pending: HashMap::new(),
        pmcount: 0,
        stalled: 0,
        pacw: 0,
        demux,
    })
}

async fn run_reply_demux(inner: Arc<ContextInner>, mut sub: Subscription) {
    while let Some(msg) = sub.next().await {
        handle_async_reply(&inner, msg);
    }
    tracing::debug!("async publish reply demux stopped");
}

fn handle_async_reply(inner: &Arc<ContextInner>, msg: Message) {
    let pending = {
        let mut guard = inner.tracker_state();
        let Some(tracker) = guard.as_mut() else {
            return;
        };
        if !msg.subject.starts_with(&tracker.reply_prefix) {
            return;
        }
        let token = &msg.subject[tracker.reply_prefix.len()..];
        match tracker.pending.remove(token) {
            Some(pending) => pending,
            // Already claimed by `pending_messages` or a publish-failure
            // rollback; the ack is dropped.
            None => return,
        }
    };

    if let Some(handler) = inner.publish_async.error_handler.clone() {
        let failure = if msg.is_no_responders() {
            Some(Error::NoResponders)
        } else {
            api::parse_error_only(&msg).err()
        };
        if let Some(error) = failure {
            let ctx = Context {
                inner: Arc::clone(inner),
            };
            handler(&ctx, PublishError::new(pending, error));
        }
        // A positive ack (or one without a configured handler) is consumed
        // here; the stored message is released.
    }

    let mut guard = inner.tracker_state();
    if let Some(tracker) = guard.as_mut() {
        tracker.pmcount = tracker.pmcount.saturating_sub(1);
        let wake = (tracker.pacw > 0 && tracker.pmcount == 0)
            || (tracker.stalled > 0
                && inner
                    .publish_async
                    .max_pending
                    .is_some_and(|maxp| tracker.pmcount <= maxp));
        if wake {
            inner.ack_notify.notify_waiters();
        }
    }
}

fn apply_publish_headers(msg: &mut Message, opts: &PublishOptions) {
    if let Some(id) = opts.msg_id.as_deref().filter(|v| !v.is_empty()) {
        msg.headers.insert(MSG_ID_HEADER, id);
    }
    if let Some(id) = opts.expect_last_msg_id.as_deref().filter(|v| !v.is_empty()) {
        msg.headers.insert(EXPECTED_LAST_MSG_ID_HEADER, id);
    }
    if let Some(stream) = opts.expect_stream.as_deref().filter(|v| !v.is_empty()) {
        msg.headers.insert(EXPECTED_STREAM_HEADER, stream);
    }
    if let Some(seq) = opts.expect_last_sequence {
        msg.headers
            .insert(EXPECTED_LAST_SEQUENCE_HEADER, seq.to_string());
    }
    if let Some(seq) = opts.expect_last_subject_sequence {
        msg.headers
            .insert(EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER, seq.to_string());
    }
}

impl Context {
    /// Store one message and wait for the service's acknowledgment.
    pub async fn publish(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        opts: &PublishOptions,
    ) -> Result<PubAck> {
        self.publish_msg(Message::new(subject, payload), opts).await
    }

    pub async fn publish_msg(&self, mut msg: Message, opts: &PublishOptions) -> Result<PubAck> {
        if msg.subject.is_empty() {
            return Err(Error::InvalidArg("message subject is required".to_string()));
        }
        apply_publish_headers(&mut msg, opts);
        let wait = opts
            .max_wait
            .filter(|d| !d.is_zero())
            .unwrap_or(self.inner.wait);
        let resp = self.inner.conn.request_msg(msg, wait).await?;
        api::parse_response(&resp)
    }

    /// Publish without waiting for the acknowledgment. The library owns the
    /// message until its ack arrives; a failure returns it to the caller.
    pub async fn publish_async(
        &self,
        payload_msg: Message,
        opts: &PublishOptions,
    ) -> std::result::Result<(), PublishError> {
        let mut msg = payload_msg;
        if msg.subject.is_empty() {
            return Err(PublishError::new(
                msg,
                Error::InvalidArg("message subject is required".to_string()),
            ));
        }
        apply_publish_headers(&mut msg, opts);

        let wire_template = msg.clone();
        let (reply, token) = self.register_pub_msg(msg).await?;

        let publish_result = self
            .inner
            .conn
            .publish_msg(wire_template.with_reply(reply));
        if let Err(err) = publish_result {
            // The message may or may not have reached the bus. If the entry
            // is still pending, hand the message back with the failure; if
            // its ack beat us here, the publish counts as a success.
            let mut guard = self.inner.tracker_state();
            if let Some(tracker) = guard.as_mut() {
                if let Some(pending) = tracker.pending.remove(&token) {
                    tracker.pmcount = tracker.pmcount.saturating_sub(1);
                    drop(guard);
                    return Err(PublishError::new(pending, err.into()));
                }
            }
        }
        Ok(())
    }

    /// Register the message in the pending map, stalling when the cap is
    /// reached. On success the map owns the message.
    async fn register_pub_msg(
        &self,
        msg: Message,
    ) -> std::result::Result<(String, String), PublishError> {
        let inner = Arc::clone(&self.inner);
        let maxp = inner.publish_async.max_pending;

        let mut notified = std::pin::pin!(inner.ack_notify.notified());
        let (reply, token) = {
            let mut guard = inner.tracker_state();
            if guard.is_none() {
                match build_tracker(&inner) {
                    Ok(tracker) => *guard = Some(tracker),
                    Err(err) => return Err(PublishError::new(msg, err)),
                }
            }
            let Some(tracker) = guard.as_mut() else {
                return Err(PublishError::new(
                    msg,
                    Error::IllegalState("context closed".to_string()),
                ));
            };
            tracker.pmcount += 1;
            let token = weir_core::base62_token(REPLY_TOKEN_LEN);
            let reply = format!("{}{}", tracker.reply_prefix, token);
            if !maxp.is_some_and(|maxp| tracker.pmcount > maxp) {
                let _ = tracker.pending.insert(token.clone(), msg);
                return Ok((reply, token));
            }
            tracker.stalled += 1;
            // Register for wakeups before the lock drops so an ack between
            // here and the first wait is not missed.
            let _ = notified.as_mut().enable();
            (reply, token)
        };

        let deadline = tokio::time::Instant::now() + inner.publish_async.stall_wait;
        loop {
            let timed_out = tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err();
            let mut guard = inner.tracker_state();
            let Some(tracker) = guard.as_mut() else {
                return Err(PublishError::new(
                    msg,
                    Error::IllegalState("context closed".to_string()),
                ));
            };
            if !maxp.is_some_and(|maxp| tracker.pmcount > maxp) {
                tracker.stalled -= 1;
                let _ = tracker.pending.insert(token.clone(), msg);
                return Ok((reply, token));
            }
            if timed_out {
                tracker.stalled -= 1;
                tracker.pmcount -= 1;
                return Err(PublishError::new(msg, Error::Stalled));
            }
            notified.set(inner.ack_notify.notified());
            let _ = notified.as_mut().enable();
        }
    }

    /// Wait until every asynchronously published message has been
    /// acknowledged, or the timeout passes.
    pub async fn publish_async_complete(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        let inner = &self.inner;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let mut notified = std::pin::pin!(inner.ack_notify.notified());
        {
            let mut guard = inner.tracker_state();
            match guard.as_mut() {
                None => return Ok(()),
                Some(tracker) if tracker.pmcount == 0 => return Ok(()),
                Some(tracker) => {
                    tracker.pacw += 1;
                    let _ = notified.as_mut().enable();
                }
            }
        }

        loop {
            let timed_out = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, notified.as_mut())
                    .await
                    .is_err(),
                None => {
                    notified.as_mut().await;
                    false
                }
            };
            let mut guard = inner.tracker_state();
            let Some(tracker) = guard.as_mut() else {
                return Ok(());
            };
            // A timeout that raced the final ack still counts as drained.
            if tracker.pmcount == 0 {
                tracker.pacw -= 1;
                return Ok(());
            }
            if timed_out {
                tracker.pacw -= 1;
                return Err(Error::Timeout);
            }
            notified.set(inner.ack_notify.notified());
            let _ = notified.as_mut().enable();
        }
    }

    /// Atomically claim every message still awaiting its ack. Acks that
    /// arrive for claimed messages are dropped.
    pub fn pending_messages(&self) -> Result<Vec<Message>> {
        let mut guard = self.inner.tracker_state();
        let Some(tracker) = guard.as_mut() else {
            return Err(Error::NotFound);
        };
        if tracker.pending.is_empty() {
            return Err(Error::NotFound);
        }
        let msgs: Vec<Message> = tracker.pending.drain().map(|(_, msg)| msg).collect();
        tracker.pmcount = tracker.pmcount.saturating_sub(msgs.len());
        Ok(msgs)
    }
}
