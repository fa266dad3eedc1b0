//! Subscription factory.
//!
//! # Purpose
//! Reconciles what the caller asked for with the consumer state the service
//! already holds: attach to an existing consumer when the configurations
//! agree, create one when nothing exists, and fail with a precise message
//! when they conflict. Push subscriptions get a supervisor pipeline; pull
//! subscriptions drive their own inbox through fetch.
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weir_wire::Message;

use crate::api::{self, err_codes, AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy};
use crate::config::{SubscribeOptions, DEFAULT_MAX_ACK_PENDING};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::supervisor::{self, Delivery, SubShared, SubState};

pub(crate) type MessageHandler = Box<dyn FnMut(StreamMessage) + Send + 'static>;

/// A message delivered by the streaming service, bound to its
/// subscription's ack machinery.
pub struct StreamMessage {
    pub(crate) message: Message,
    pub(crate) shared: Arc<SubShared>,
    pub(crate) acked: Arc<AtomicBool>,
}

impl Deref for StreamMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessage")
            .field("subject", &self.message.subject)
            .field("reply", &self.message.reply)
            .field("acked", &self.acked.load(Ordering::Relaxed))
            .finish()
    }
}

impl StreamMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

/// The client-side sequence view of a consumer that fell out of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMismatch {
    pub stream_sequence: u64,
    pub consumer_client_sequence: u64,
    pub consumer_server_sequence: u64,
}

/// Push subscription. Created either queue-style (`next()`) or with a
/// message handler.
pub struct PushSubscription {
    shared: Arc<SubShared>,
    rx: Option<mpsc::UnboundedReceiver<StreamMessage>>,
    supervisor: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSubscription")
            .field("stream", &self.shared.stream)
            .finish()
    }
}

impl PushSubscription {
    /// Await the next user message.
    ///
    /// Surfaces a latched consumer sequence mismatch once as
    /// [`Error::Mismatch`], then resumes normal delivery.
    pub async fn next(&mut self) -> Result<Option<StreamMessage>> {
        {
            let mut state = self.shared.state();
            if state.sm {
                state.sm = false;
                return Err(Error::Mismatch);
            }
        }
        let rx = self.rx.as_mut().ok_or_else(|| {
            Error::InvalidSubscription("subscription delivers through a message handler".to_string())
        })?;
        Ok(rx.recv().await)
    }

    /// The current gap between this client and the server's view of the
    /// consumer, or [`Error::NotFound`] when the two agree.
    pub fn sequence_mismatch(&self) -> Result<SequenceMismatch> {
        let state = self.shared.state();
        if state.dseq == state.ldseq {
            return Err(Error::NotFound);
        }
        Ok(SequenceMismatch {
            stream_sequence: state.sseq,
            consumer_client_sequence: state.dseq,
            consumer_server_sequence: state.ldseq,
        })
    }

    pub fn stream(&self) -> &str {
        &self.shared.stream
    }

    pub fn consumer(&self) -> Option<String> {
        self.shared.consumer_name()
    }

    /// Stop delivery and delete the consumer when this subscription
    /// created it.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.stop_tasks();
        delete_owned_consumer(&self.shared).await
    }

    fn stop_tasks(&mut self) {
        self.supervisor.abort();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Pull subscription driven by [`PullSubscription::fetch`].
pub struct PullSubscription {
    pub(crate) shared: Arc<SubShared>,
    pub(crate) sub: weir_core::Subscription,
    heartbeat: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PullSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSubscription")
            .field("stream", &self.shared.stream)
            .finish()
    }
}

impl PullSubscription {
    pub fn stream(&self) -> &str {
        &self.shared.stream
    }

    pub fn consumer(&self) -> Option<String> {
        self.shared.consumer_name()
    }

    pub async fn unsubscribe(self) -> Result<()> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        delete_owned_consumer(&self.shared).await
    }
}

impl Drop for PullSubscription {
    fn drop(&mut self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

/// Delete the consumer this subscription created, exactly once. Failures
/// are reported through the connection error callback as well as returned.
async fn delete_owned_consumer(shared: &Arc<SubShared>) -> Result<()> {
    if !shared.dc.swap(false, Ordering::AcqRel) {
        return Ok(());
    }
    let Some(consumer) = shared.consumer_name() else {
        return Ok(());
    };
    // Snapshot first: the delete round-trips on the connection and no
    // subscription state lock may be held across it.
    let result = shared
        .ctx
        .delete_consumer_at(&shared.prefix, shared.wait, &shared.stream, &consumer)
        .await;
    if let Err(err) = &result {
        shared.conn().post_error(
            &shared.subject,
            format!("failed to delete consumer '{consumer}': {err}"),
        );
    }
    result
}

impl Context {
    /// Queue-style push subscription: messages are buffered for
    /// [`PushSubscription::next`].
    pub async fn subscribe(&self, subject: &str, opts: SubscribeOptions) -> Result<PushSubscription> {
        let (shared, core_sub, hbi) = self.subscribe_impl(subject, None, false, opts).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor =
            supervisor::spawn_push_supervisor(Arc::clone(&shared), core_sub, Delivery::Queue(tx));
        let heartbeat = self.arm_heartbeat(&shared, hbi);
        Ok(PushSubscription {
            shared,
            rx: Some(rx),
            supervisor,
            heartbeat,
        })
    }

    /// Push subscription delivering through `handler`. Unless manual ack is
    /// requested (or the consumer does not acknowledge at all), each message
    /// is positively acknowledged after the handler returns.
    pub async fn subscribe_with<F>(
        &self,
        subject: &str,
        handler: F,
        opts: SubscribeOptions,
    ) -> Result<PushSubscription>
    where
        F: FnMut(StreamMessage) + Send + 'static,
    {
        let auto_ack = !opts.manual_ack && opts.config.ack_policy != Some(AckPolicy::None);
        let (shared, core_sub, hbi) = self.subscribe_impl(subject, None, false, opts).await?;
        let supervisor = supervisor::spawn_push_supervisor(
            Arc::clone(&shared),
            core_sub,
            Delivery::Handler {
                handler: Box::new(handler),
                auto_ack,
            },
        );
        let heartbeat = self.arm_heartbeat(&shared, hbi);
        Ok(PushSubscription {
            shared,
            rx: None,
            supervisor,
            heartbeat,
        })
    }

    /// Pull subscription bound to `durable`, driven by explicit fetches.
    pub async fn pull_subscribe(
        &self,
        subject: &str,
        durable: &str,
        opts: SubscribeOptions,
    ) -> Result<PullSubscription> {
        if durable.is_empty() {
            return Err(Error::InvalidArg(
                "durable name is required for pull subscriptions".to_string(),
            ));
        }
        match opts.config.ack_policy {
            Some(AckPolicy::None) => {
                return Err(Error::InvalidArg(
                    "invalid ack mode 'none' for pull consumers".to_string(),
                ))
            }
            Some(AckPolicy::All) => {
                return Err(Error::InvalidArg(
                    "invalid ack mode 'all' for pull consumers".to_string(),
                ))
            }
            _ => {}
        }
        let (shared, sub, hbi) = self.subscribe_impl(subject, Some(durable), true, opts).await?;
        let heartbeat = self.arm_heartbeat(&shared, hbi);
        Ok(PullSubscription {
            shared,
            sub,
            heartbeat,
        })
    }

    fn arm_heartbeat(
        &self,
        shared: &Arc<SubShared>,
        hbi: Option<Duration>,
    ) -> Option<JoinHandle<()>> {
        // Missed heartbeats are reported through the connection's error
        // callback; without one there is nothing to watch for.
        match hbi {
            Some(hbi) if self.inner.conn.has_error_callback() => {
                Some(supervisor::spawn_heartbeat_timer(Arc::clone(shared), hbi))
            }
            _ => None,
        }
    }

    async fn subscribe_impl(
        &self,
        subject: &str,
        pull_durable: Option<&str>,
        pull: bool,
        mut opts: SubscribeOptions,
    ) -> Result<(Arc<SubShared>, weir_core::Subscription, Option<Duration>)> {
        if subject.is_empty() {
            return Err(Error::InvalidArg("subject is required".to_string()));
        }
        let (prefix, wait) = self.resolve(&opts.call);

        // An optional start sequence or time implies the matching deliver
        // policy; the service rejects a conflicting combination.
        if opts.config.opt_start_seq.unwrap_or(0) > 0 {
            opts.config.deliver_policy = Some(DeliverPolicy::ByStartSequence);
        }
        if opts.config.opt_start_time.unwrap_or(0) > 0 {
            opts.config.deliver_policy = Some(DeliverPolicy::ByStartTime);
        }

        let queue = opts.queue.clone().filter(|q| !q.is_empty());
        if queue.is_some() {
            if opts.config.idle_heartbeat.unwrap_or(0) > 0 {
                return Err(Error::QueueHeartbeat);
            }
            if opts.config.flow_control {
                return Err(Error::QueueFlowControl);
            }
        }

        let mut durable = pull_durable
            .map(str::to_string)
            .or_else(|| opts.config.durable_name.clone())
            .filter(|d| !d.is_empty());
        let mut consumer = opts.consumer.clone().filter(|c| !c.is_empty());
        let stream_opt = opts.stream.clone().filter(|s| !s.is_empty());
        let consumer_bound = stream_opt.is_some() && consumer.is_some();

        if consumer.is_none() {
            // A queue subscription without a durable shares the queue name
            // as its durable.
            if queue.is_some() && durable.is_none() {
                durable = queue.clone();
            }
            consumer = durable.clone();
        }

        let stream = match stream_opt {
            Some(stream) => stream,
            None => self.lookup_stream_by_subject(subject, &prefix, wait).await?,
        };

        let mut info: Option<ConsumerInfo> = None;
        let mut tolerated_lookup_failure = false;
        if let Some(name) = &consumer {
            match self.consumer_info_at(&prefix, wait, &stream, name).await {
                Ok(existing) => info = Some(existing),
                Err(err) => {
                    let lookup_err = matches!(err, Error::Timeout)
                        || err.err_code() == Some(err_codes::NOT_ENABLED);
                    match err {
                        // Nothing to attach to; create below.
                        Error::NotFound if !consumer_bound => {}
                        // An explicit pull bind rides out a lookup failure:
                        // the consumer may exist even if we cannot ask.
                        _ if pull && lookup_err && consumer_bound => {
                            tolerated_lookup_failure = true
                        }
                        err => return Err(err),
                    }
                }
            }
        }
        let mut create = info.is_none() && !tolerated_lookup_failure;

        loop {
            let mut cfg = opts.config.clone();
            let mut hbi_ns: i64 = 0;
            let mut deliver: Option<String> = None;
            if let Some(existing) = &info {
                deliver = process_consumer_info(
                    existing,
                    &opts.config,
                    pull,
                    subject,
                    queue.as_deref(),
                )?;
                hbi_ns = existing.config.idle_heartbeat.unwrap_or(0);
            } else if create {
                if !pull {
                    let inbox = self.inner.conn.new_inbox();
                    cfg.deliver_subject = Some(inbox.clone());
                    deliver = Some(inbox);
                }
                cfg.durable_name = durable.clone();
                cfg.deliver_group = queue.clone();
                // The service clears the filter when it covers the whole
                // stream.
                cfg.filter_subject = Some(subject.to_string());
                if cfg.max_ack_pending.is_none() && cfg.ack_policy != Some(AckPolicy::None) {
                    cfg.max_ack_pending = Some(DEFAULT_MAX_ACK_PENDING);
                }
                hbi_ns = cfg.idle_heartbeat.unwrap_or(0);
            }

            // Pull consumers are driven through an inbox of our own; push
            // consumers deliver where the consumer points.
            let deliver_subject = match &deliver {
                Some(subject) if !pull => subject.clone(),
                _ => self.inner.conn.new_inbox(),
            };
            let core_sub = match &queue {
                Some(group) => self.inner.conn.queue_subscribe(&deliver_subject, group)?,
                None => self.inner.conn.subscribe(&deliver_subject)?,
            };

            let shared = Arc::new(SubShared {
                ctx: self.clone(),
                subject: subject.to_string(),
                stream: stream.clone(),
                consumer: Mutex::new(consumer.clone()),
                prefix: prefix.clone(),
                wait,
                pull,
                dc: AtomicBool::new(false),
                next_subject: if pull {
                    consumer
                        .as_ref()
                        .map(|name| api::next_msg_subject(&prefix, &stream, name))
                } else {
                    None
                },
                state: Mutex::new(SubState::default()),
            });

            let hbi = heartbeat_interval(hbi_ns);
            if !create {
                return Ok((shared, core_sub, hbi));
            }

            match self.add_consumer_at(&prefix, wait, &stream, &cfg).await {
                Ok(created) => {
                    *shared
                        .consumer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(created.name.clone());
                    shared.dc.store(true, Ordering::Release);
                    return Ok((shared, core_sub, hbi));
                }
                Err(err)
                    if matches!(
                        err.err_code(),
                        Some(err_codes::CONSUMER_EXISTING_ACTIVE)
                            | Some(err_codes::CONSUMER_NAME_EXIST)
                    ) =>
                {
                    // Another subscriber won the race to create this
                    // durable; drop the half-built subscription and attach
                    // to the winner's consumer.
                    drop(core_sub);
                    let name = consumer.clone().ok_or_else(|| {
                        Error::IllegalState(
                            "consumer create race without a durable name".to_string(),
                        )
                    })?;
                    info = Some(self.consumer_info_at(&prefix, wait, &stream, &name).await?);
                    create = false;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn heartbeat_interval(hbi_ns: i64) -> Option<Duration> {
    let millis = hbi_ns / 1_000_000;
    (millis > 0).then(|| Duration::from_millis(millis as u64))
}

/// Reconcile an existing consumer with the caller's intent. Returns the
/// deliver subject for push consumers.
fn process_consumer_info(
    info: &ConsumerInfo,
    user: &ConsumerConfig,
    pull: bool,
    subject: &str,
    queue: Option<&str>,
) -> Result<Option<String>> {
    let server = &info.config;

    // The requested subject must be the consumer's filter, when it has one.
    if let Some(filter) = server.filter_subject.as_deref().filter(|f| !f.is_empty()) {
        if filter != subject {
            return Err(Error::FilterMismatch {
                subject: subject.to_string(),
                filter: filter.to_string(),
            });
        }
    }

    if queue.is_some() {
        if server.idle_heartbeat.unwrap_or(0) > 0 {
            return Err(Error::QueueHeartbeat);
        }
        if server.flow_control {
            return Err(Error::QueueFlowControl);
        }
    }

    let deliver_subject = server
        .deliver_subject
        .as_deref()
        .filter(|d| !d.is_empty());
    if pull && deliver_subject.is_some() {
        return Err(Error::PullToPushConsumer);
    }
    if !pull && deliver_subject.is_none() {
        return Err(Error::PullSubscribeRequired);
    }
    if pull {
        check_config(server, user)?;
        return Ok(None);
    }

    let deliver_group = server
        .deliver_group
        .as_deref()
        .filter(|g| !g.is_empty());
    match (deliver_group, queue) {
        (None, Some(_)) => return Err(Error::QueueWithoutDeliverGroup),
        (None, None) if info.push_bound => return Err(Error::ConsumerBound),
        (None, None) => {}
        (Some(group), None) => {
            return Err(Error::DeliverGroupRequiresQueue(group.to_string()))
        }
        (Some(group), Some(queue)) if group != queue => {
            return Err(Error::DeliverGroupMismatch {
                queue: queue.to_string(),
                group: group.to_string(),
            })
        }
        (Some(_), Some(_)) => {}
    }

    check_config(server, user)?;
    Ok(deliver_subject.map(str::to_string))
}

/// Reject an attach when an explicitly set user value disagrees with the
/// existing consumer. Unset user values never reject; flow control is the
/// one asymmetric field the library can absorb on its own.
fn check_config(server: &ConsumerConfig, user: &ConsumerConfig) -> Result<()> {
    fn mismatch<T: fmt::Debug>(field: &'static str, requested: &T, actual: &T) -> Error {
        Error::ConfigMismatch {
            field,
            requested: format!("{requested:?}"),
            server: format!("{actual:?}"),
        }
    }
    fn string_differs(user: Option<&str>, server: Option<&str>) -> bool {
        match user.filter(|u| !u.is_empty()) {
            None => false,
            Some(user) => server.filter(|s| !s.is_empty()) != Some(user),
        }
    }

    if string_differs(user.durable_name.as_deref(), server.durable_name.as_deref()) {
        return Err(mismatch("durable", &user.durable_name, &server.durable_name));
    }
    if string_differs(user.description.as_deref(), server.description.as_deref()) {
        return Err(mismatch(
            "description",
            &user.description,
            &server.description,
        ));
    }
    if user.deliver_policy.is_some() && user.deliver_policy != server.deliver_policy {
        return Err(mismatch(
            "deliver policy",
            &user.deliver_policy,
            &server.deliver_policy,
        ));
    }
    if user.opt_start_seq.unwrap_or(0) > 0 && user.opt_start_seq != server.opt_start_seq {
        return Err(mismatch(
            "optional start sequence",
            &user.opt_start_seq,
            &server.opt_start_seq,
        ));
    }
    if user.opt_start_time.unwrap_or(0) > 0 && user.opt_start_time != server.opt_start_time {
        return Err(mismatch(
            "optional start time",
            &user.opt_start_time,
            &server.opt_start_time,
        ));
    }
    if user.ack_policy.is_some() && user.ack_policy != server.ack_policy {
        return Err(mismatch("ack policy", &user.ack_policy, &server.ack_policy));
    }
    if user.ack_wait.unwrap_or(0) > 0 && user.ack_wait != server.ack_wait {
        return Err(mismatch("ack wait", &user.ack_wait, &server.ack_wait));
    }
    if user.max_deliver.unwrap_or(0) > 0 && user.max_deliver != server.max_deliver {
        return Err(mismatch(
            "max deliver",
            &user.max_deliver,
            &server.max_deliver,
        ));
    }
    if user.replay_policy.is_some() && user.replay_policy != server.replay_policy {
        return Err(mismatch(
            "replay policy",
            &user.replay_policy,
            &server.replay_policy,
        ));
    }
    if user.rate_limit_bps.unwrap_or(0) > 0 && user.rate_limit_bps != server.rate_limit_bps {
        return Err(mismatch(
            "rate limit",
            &user.rate_limit_bps,
            &server.rate_limit_bps,
        ));
    }
    if string_differs(user.sample_freq.as_deref(), server.sample_freq.as_deref()) {
        return Err(mismatch(
            "sample frequency",
            &user.sample_freq,
            &server.sample_freq,
        ));
    }
    if user.max_waiting.unwrap_or(0) > 0 && user.max_waiting != server.max_waiting {
        return Err(mismatch(
            "max waiting",
            &user.max_waiting,
            &server.max_waiting,
        ));
    }
    if user.max_ack_pending.unwrap_or(0) > 0 && user.max_ack_pending != server.max_ack_pending {
        return Err(mismatch(
            "max ack pending",
            &user.max_ack_pending,
            &server.max_ack_pending,
        ));
    }
    // The library answers flow control transparently, so only the explicit
    // request for it can be disappointed.
    if user.flow_control && !server.flow_control {
        return Err(mismatch("flow control", &user.flow_control, &server.flow_control));
    }
    if user.idle_heartbeat.unwrap_or(0) > 0 && user.idle_heartbeat != server.idle_heartbeat {
        return Err(mismatch(
            "heartbeat",
            &user.idle_heartbeat,
            &server.idle_heartbeat,
        ));
    }
    Ok(())
}
