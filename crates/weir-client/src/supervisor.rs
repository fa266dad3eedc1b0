//! Per-subscription delivery supervision.
//!
//! # Purpose
//! Push deliveries flow through a supervisor task that classifies control
//! messages (idle heartbeats, flow control requests), keeps the liveness
//! flag and sequence bookkeeping current, and hands user messages to the
//! configured delivery path, wrapping them in the automatic acknowledgment
//! when asked to.
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use weir_core::{Connection, Subscription};
use weir_wire::{ControlType, Message};

use crate::ack::ACK_ACK;
use crate::context::Context;
use crate::meta;
use crate::subscribe::{MessageHandler, StreamMessage};

pub(crate) const LAST_CONSUMER_HEADER: &str = "Nats-Last-Consumer";

/// Streaming-side state attached to one subscription.
pub(crate) struct SubShared {
    pub(crate) ctx: Context,
    /// The user-facing filter subject.
    pub(crate) subject: String,
    pub(crate) stream: String,
    pub(crate) consumer: Mutex<Option<String>>,
    pub(crate) prefix: String,
    pub(crate) wait: Duration,
    pub(crate) pull: bool,
    /// The factory created this consumer; delete it on unsubscribe.
    pub(crate) dc: AtomicBool,
    /// Pull next-message request subject.
    pub(crate) next_subject: Option<String>,
    pub(crate) state: Mutex<SubState>,
}

impl SubShared {
    pub(crate) fn conn(&self) -> &Connection {
        &self.ctx.inner.conn
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn consumer_name(&self) -> Option<String> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Default)]
pub(crate) struct SubState {
    /// Ack-subject tail of the last data message.
    pub(crate) cmeta: Option<String>,
    pub(crate) sseq: u64,
    pub(crate) dseq: u64,
    /// Last consumer sequence the server reported on an idle heartbeat.
    pub(crate) ldseq: u64,
    /// Traffic observed since the heartbeat timer last looked.
    pub(crate) active: bool,
    /// A sequence gap is latched and unreported gaps are suppressed until
    /// the consumer catches up.
    pub(crate) sm: bool,
    pub(crate) ssmn: bool,
    pub(crate) fc_reply: Option<String>,
    pub(crate) fc_delivered: u64,
    pub(crate) delivered: u64,
}

pub(crate) enum Delivery {
    /// Buffer messages for `next()`.
    Queue(mpsc::UnboundedSender<StreamMessage>),
    Handler {
        handler: MessageHandler,
        auto_ack: bool,
    },
}

pub(crate) fn spawn_push_supervisor(
    shared: Arc<SubShared>,
    sub: Subscription,
    delivery: Delivery,
) -> JoinHandle<()> {
    tokio::spawn(run_push_supervisor(shared, sub, delivery))
}

async fn run_push_supervisor(shared: Arc<SubShared>, mut sub: Subscription, mut delivery: Delivery) {
    let handler_mode = matches!(delivery, Delivery::Handler { .. });
    while let Some(msg) = sub.next().await {
        {
            let mut state = shared.state();
            state.delivered += 1;
        }
        match msg.control_type() {
            Some(ControlType::Heartbeat) => {
                process_heartbeat(&shared, &msg, handler_mode);
                flow_control_check(&shared);
                continue;
            }
            Some(ControlType::FlowControl) => {
                schedule_flow_control(&shared, &msg, &sub);
                // Everything ahead of the request may already be out.
                flow_control_check(&shared);
                continue;
            }
            None => {}
        }
        track_sequences(&shared, &msg);
        let delivery_msg = StreamMessage {
            message: msg,
            shared: Arc::clone(&shared),
            acked: Arc::new(AtomicBool::new(false)),
        };
        match &mut delivery {
            Delivery::Queue(tx) => {
                if tx.send(delivery_msg).is_err() {
                    break;
                }
            }
            Delivery::Handler { handler, auto_ack } => {
                if *auto_ack {
                    // Capture the ack coordinates before the handler takes
                    // the message.
                    let reply = delivery_msg.message.reply.clone();
                    let acked = Arc::clone(&delivery_msg.acked);
                    handler(delivery_msg);
                    if let Some(reply) = reply {
                        if !acked.swap(true, Ordering::AcqRel) {
                            let _ = shared.conn().publish(&reply, Bytes::from_static(ACK_ACK));
                        }
                    }
                } else {
                    handler(delivery_msg);
                }
            }
        }
        flow_control_check(&shared);
    }
    tracing::debug!(subject = %shared.subject, "subscription supervisor stopped");
}

/// A data message counts as liveness and its ack subject becomes the
/// sequence reference for the next idle heartbeat.
pub(crate) fn track_sequences(shared: &SubShared, msg: &Message) {
    let Some(reply) = &msg.reply else {
        return;
    };
    let Some(tail) = reply.strip_prefix(meta::ACK_PREFIX) else {
        return;
    };
    let mut state = shared.state();
    state.active = true;
    state.cmeta = Some(tail.to_string());
}

fn process_heartbeat(shared: &SubShared, msg: &Message, handler_mode: bool) {
    let report = {
        let mut state = shared.state();
        state.active = true;
        let Some(cmeta) = state.cmeta.clone() else {
            return;
        };
        let parsed = match meta::parse_ack_tokens(&cmeta) {
            Ok(parsed) => parsed,
            Err(err) => {
                drop(state);
                tracing::warn!(subject = %shared.subject, error = %err, "invalid ack subject on heartbeat check");
                return;
            }
        };
        state.sseq = parsed.stream_sequence;
        state.dseq = parsed.consumer_sequence;

        // The comparison only runs when the heartbeat reports where the
        // consumer stands.
        let Some(reported) = msg.headers.get(LAST_CONSUMER_HEADER) else {
            return;
        };
        let Ok(ldseq) = reported.parse::<u64>() else {
            drop(state);
            tracing::warn!(subject = %shared.subject, value = %reported, "invalid last consumer sequence header");
            return;
        };
        state.ldseq = ldseq;

        if state.ldseq == state.dseq {
            // Gap resolved; allow the next one to be reported again.
            state.sm = false;
            state.ssmn = false;
            false
        } else if !state.ssmn {
            state.sm = true;
            state.ssmn = true;
            handler_mode
        } else {
            false
        }
    };
    if report {
        shared
            .conn()
            .post_error(&shared.subject, "consumer sequence mismatch");
    }
}

fn schedule_flow_control(shared: &SubShared, msg: &Message, sub: &Subscription) {
    let Some(reply) = &msg.reply else {
        return;
    };
    let mut state = shared.state();
    state.fc_reply = Some(reply.clone());
    // Answer once everything queued ahead of this request has been handed
    // out.
    state.fc_delivered = state.delivered + sub.pending() as u64;
}

fn flow_control_check(shared: &SubShared) {
    let reply = {
        let mut state = shared.state();
        if state
            .fc_reply
            .as_ref()
            .is_some_and(|_| state.delivered >= state.fc_delivered)
        {
            state.fc_reply.take()
        } else {
            None
        }
    };
    if let Some(reply) = reply {
        let _ = shared.conn().publish(&reply, Bytes::new());
    }
}

/// Liveness watchdog: posts a missed-heartbeat error when no traffic was
/// seen for two heartbeat intervals.
pub(crate) fn spawn_heartbeat_timer(shared: Arc<SubShared>, hbi: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hbi * 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let alert = {
                let mut state = shared.state();
                let alert = !state.active;
                state.active = false;
                alert
            };
            if alert {
                shared
                    .conn()
                    .post_error(&shared.subject, "missed heartbeat");
            }
        }
    })
}
