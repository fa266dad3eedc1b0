//! In-process pub/sub core connection.
//!
//! # Purpose
//! Provides the transport the streaming layer runs on: subject-based
//! publish/subscribe with wildcard filters and queue groups, request/reply
//! over generated inbox subjects, and a connection-level asynchronous error
//! callback. Everything is process-local; reconnect logic and a network
//! wire protocol are out of scope for this layer.
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use weir_wire::Message;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
    #[error("request timed out")]
    Timeout,
    #[error("no responders available for request")]
    NoResponders,
    #[error("connection closed")]
    Closed,
}

impl From<weir_wire::Error> for Error {
    fn from(err: weir_wire::Error) -> Self {
        match err {
            weir_wire::Error::InvalidSubject(s) => Error::InvalidSubject(s),
        }
    }
}

pub const INBOX_PREFIX: &str = "_INBOX.";

const BASE62_DIGITS: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random base62 token. Uniqueness within a process lifetime is all that is
/// required of these; they are not security tokens.
pub fn base62_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE62_DIGITS[rng.gen_range(0..BASE62_DIGITS.len())] as char)
        .collect()
}

/// Error surfaced through a connection's asynchronous error callback.
#[derive(Debug, Clone)]
pub struct SubscriptionError {
    /// Subject of the subscription the error relates to.
    pub subject: String,
    pub error: String,
}

pub type ErrorCallback = Arc<dyn Fn(SubscriptionError) + Send + Sync>;

/// Returns true when `subject` matches the subscription `filter`.
///
/// `*` matches exactly one token, a trailing `>` matches one or more.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut tokens = subject.split('.');
    for ft in filter.split('.') {
        match ft {
            ">" => return tokens.next().is_some(),
            "*" => {
                if tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    tokens.next().is_none()
}

struct SubEntry {
    filter: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
    pending: Arc<AtomicUsize>,
}

#[derive(Default)]
struct BusState {
    next_sid: u64,
    subs: HashMap<u64, SubEntry>,
    // Rotation cursor per queue group name.
    queue_cursor: HashMap<String, usize>,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
}

impl BusInner {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Hand the message to every matching subscription, one member per queue
    // group. Returns whether anyone received it.
    fn deliver(&self, msg: &Message) -> bool {
        let mut targets: Vec<(mpsc::UnboundedSender<Message>, Arc<AtomicUsize>, u64)> = Vec::new();
        {
            let mut state = self.state();
            let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
            for (sid, entry) in &state.subs {
                if !subject_matches(&entry.filter, &msg.subject) {
                    continue;
                }
                match &entry.queue {
                    Some(group) => groups.entry(group.clone()).or_default().push(*sid),
                    None => {
                        targets.push((entry.tx.clone(), Arc::clone(&entry.pending), *sid));
                    }
                }
            }
            for (group, mut members) in groups {
                members.sort_unstable();
                let cursor = state.queue_cursor.entry(group).or_insert(0);
                let sid = members[*cursor % members.len()];
                *cursor = cursor.wrapping_add(1);
                if let Some(entry) = state.subs.get(&sid) {
                    targets.push((entry.tx.clone(), Arc::clone(&entry.pending), sid));
                }
            }
        }
        let mut delivered = false;
        let mut dead = Vec::new();
        for (tx, pending, sid) in targets {
            if tx.send(msg.clone()).is_ok() {
                pending.fetch_add(1, Ordering::Relaxed);
                delivered = true;
            } else {
                dead.push(sid);
            }
        }
        if !dead.is_empty() {
            tracing::debug!(count = dead.len(), "removing closed subscriptions");
            let mut state = self.state();
            for sid in dead {
                let _ = state.subs.remove(&sid);
            }
        }
        delivered
    }

    fn publish(&self, msg: Message) -> Result<()> {
        weir_wire::validate_subject(&msg.subject, false)?;
        if !self.deliver(&msg) {
            // Requests to subjects with no interest get an immediate
            // no-responders status so callers do not wait out the timeout.
            if let Some(reply) = &msg.reply {
                let nr = Message::status_message(
                    reply.clone(),
                    weir_wire::STATUS_NO_RESPONDERS,
                    "No Responders",
                );
                let _ = self.deliver(&nr);
            }
        }
        Ok(())
    }

    fn subscribe(self: &Arc<Self>, filter: &str, queue: Option<String>) -> Result<Subscription> {
        weir_wire::validate_subject(filter, true)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let sid = {
            let mut state = self.state();
            state.next_sid += 1;
            let sid = state.next_sid;
            let _ = state.subs.insert(
                sid,
                SubEntry {
                    filter: filter.to_string(),
                    queue,
                    tx,
                    pending: Arc::clone(&pending),
                },
            );
            sid
        };
        Ok(Subscription {
            sid,
            subject: filter.to_string(),
            rx,
            pending,
            bus: Arc::clone(self),
        })
    }
}

/// The process-local message bus. Connections created from the same bus see
/// each other's traffic.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner {
                bus: Arc::clone(&self.inner),
                error_cb: Mutex::new(None),
            }),
        }
    }
}

struct ConnectionInner {
    bus: Arc<BusInner>,
    error_cb: Mutex<Option<ErrorCallback>>,
}

/// Handle to the bus. Cheap to clone; all clones share the error callback.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_msg(Message::new(subject, payload))
    }

    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_msg(Message::new(subject, payload).with_reply(reply))
    }

    pub fn publish_msg(&self, msg: Message) -> Result<()> {
        self.inner.bus.publish(msg)
    }

    pub fn subscribe(&self, filter: &str) -> Result<Subscription> {
        self.inner.bus.subscribe(filter, None)
    }

    pub fn queue_subscribe(&self, filter: &str, group: &str) -> Result<Subscription> {
        self.inner.bus.subscribe(filter, Some(group.to_string()))
    }

    /// Publish a request and await the first reply on a fresh inbox.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_msg(Message::new(subject, payload), timeout)
            .await
    }

    pub async fn request_msg(&self, mut msg: Message, timeout: Duration) -> Result<Message> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox)?;
        msg.reply = Some(inbox);
        self.publish_msg(msg)?;
        match tokio::time::timeout(timeout, sub.next()).await {
            Err(_) => Err(Error::Timeout),
            Ok(None) => Err(Error::Closed),
            Ok(Some(reply)) if reply.is_no_responders() => Err(Error::NoResponders),
            Ok(Some(reply)) => Ok(reply),
        }
    }

    pub fn new_inbox(&self) -> String {
        format!("{INBOX_PREFIX}{}", base62_token(16))
    }

    pub fn set_error_callback(
        &self,
        cb: impl Fn(SubscriptionError) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .error_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(cb));
    }

    pub fn has_error_callback(&self) -> bool {
        self.inner
            .error_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Invoke the connection's error callback, if one is installed.
    pub fn post_error(&self, subject: &str, error: impl Into<String>) {
        let cb = self
            .inner
            .error_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(cb) = cb {
            cb(SubscriptionError {
                subject: subject.to_string(),
                error: error.into(),
            });
        }
    }
}

/// A subscription's inbound message queue.
pub struct Subscription {
    sid: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
    pending: Arc<AtomicUsize>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Number of messages queued and not yet consumed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub async fn next(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            let _ = self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    /// Non-blocking pop of an already-queued message.
    pub fn try_next(&mut self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(msg) => {
                let _ = self.pending.fetch_sub(1, Ordering::Relaxed);
                Some(msg)
            }
            Err(_) => None,
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.bus.state();
        let _ = state.subs.remove(&self.sid);
    }
}
