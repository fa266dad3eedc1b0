//! Streaming context: configuration, API prefix resolution, and the
//! management operations the subscription factory builds on.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use weir_core::Connection;

use crate::api::{
    self, ConsumerConfig, ConsumerInfo, CreateConsumerRequest, PurgeRequest, StreamInfo,
    StreamInfoRequest, StreamNamesRequest, StreamNamesResponse, SuccessResponse,
};
use crate::config::{
    derive_prefix, CallOptions, PublishErrorHandler, PurgeOptions, StreamingOptions,
    DEFAULT_REQUEST_WAIT, DEFAULT_STALL_WAIT,
};
use crate::error::{Error, Result};
use crate::publish::Tracker;

pub(crate) struct PublishAsyncConfig {
    pub(crate) max_pending: Option<usize>,
    pub(crate) stall_wait: Duration,
    pub(crate) error_handler: Option<PublishErrorHandler>,
}

pub(crate) struct ContextInner {
    pub(crate) conn: Connection,
    pub(crate) prefix: String,
    pub(crate) wait: Duration,
    pub(crate) purge: PurgeOptions,
    pub(crate) deleted_details: bool,
    pub(crate) publish_async: PublishAsyncConfig,
    // Lazily created on the first asynchronous publish.
    pub(crate) tracker: Mutex<Option<Tracker>>,
    // Wakes stalled publishers and completion waiters as acks drain.
    pub(crate) ack_notify: Notify,
}

impl ContextInner {
    pub(crate) fn tracker_state(&self) -> MutexGuard<'_, Option<Tracker>> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the streaming service over a core connection.
///
/// ```
/// use weir_client::{Context, StreamingOptions};
/// use weir_core::Bus;
///
/// let bus = Bus::new();
/// let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
/// assert_eq!(ctx.api_prefix(), "$JS.API");
/// ```
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(conn: Connection, opts: StreamingOptions) -> Result<Self> {
        let prefix = derive_prefix(opts.domain.as_deref(), opts.prefix.as_deref());
        let wait = opts
            .wait
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_REQUEST_WAIT);
        let stall_wait = opts
            .publish_async
            .stall_wait
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_STALL_WAIT);
        Ok(Self {
            inner: Arc::new(ContextInner {
                conn,
                prefix,
                wait,
                purge: opts.stream.purge,
                deleted_details: opts.stream.info.deleted_details,
                publish_async: PublishAsyncConfig {
                    max_pending: opts.publish_async.max_pending,
                    stall_wait,
                    error_handler: opts.publish_async.error_handler,
                },
                tracker: Mutex::new(None),
                ack_notify: Notify::new(),
            }),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn api_prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Resolve the effective prefix and wait for one call.
    pub(crate) fn resolve(&self, call: &CallOptions) -> (String, Duration) {
        let prefix = if call.domain.as_deref().is_some_and(|d| !d.is_empty())
            || call.prefix.as_deref().is_some_and(|p| !p.is_empty())
        {
            derive_prefix(call.domain.as_deref(), call.prefix.as_deref())
        } else {
            self.inner.prefix.clone()
        };
        let wait = call.wait.filter(|d| !d.is_zero()).unwrap_or(self.inner.wait);
        (prefix, wait)
    }

    /// Tear down the async publish machinery and drop any messages whose
    /// acks have not arrived. Publishes in flight at this point are lost.
    pub fn close(&self) {
        let tracker = self.inner.tracker_state().take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
        self.inner.ack_notify.notify_waiters();
    }

    pub async fn add_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
        call: &CallOptions,
    ) -> Result<ConsumerInfo> {
        let (prefix, wait) = self.resolve(call);
        self.add_consumer_at(&prefix, wait, stream, config).await
    }

    pub(crate) async fn add_consumer_at(
        &self,
        prefix: &str,
        wait: Duration,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        validate_name("stream", stream)?;
        if let Some(durable) = config.durable_name.as_deref() {
            validate_name("durable", durable)?;
        }
        let subject = api::create_consumer_subject(prefix, stream, config.durable_name.as_deref());
        let payload = serde_json::to_vec(&CreateConsumerRequest {
            stream_name: stream,
            config,
        })?;
        api::request_json(self.connection(), &subject, payload, wait).await
    }

    pub async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
        call: &CallOptions,
    ) -> Result<ConsumerInfo> {
        let (prefix, wait) = self.resolve(call);
        self.consumer_info_at(&prefix, wait, stream, consumer).await
    }

    pub(crate) async fn consumer_info_at(
        &self,
        prefix: &str,
        wait: Duration,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo> {
        validate_name("stream", stream)?;
        validate_name("consumer", consumer)?;
        let subject = api::consumer_info_subject(prefix, stream, consumer);
        let result: Result<ConsumerInfo> =
            api::request_json(self.connection(), &subject, Vec::new(), wait).await;
        match result {
            Err(Error::Api { code: 404, .. }) => Err(Error::NotFound),
            other => other,
        }
    }

    pub async fn delete_consumer(
        &self,
        stream: &str,
        consumer: &str,
        call: &CallOptions,
    ) -> Result<()> {
        let (prefix, wait) = self.resolve(call);
        self.delete_consumer_at(&prefix, wait, stream, consumer)
            .await
    }

    pub(crate) async fn delete_consumer_at(
        &self,
        prefix: &str,
        wait: Duration,
        stream: &str,
        consumer: &str,
    ) -> Result<()> {
        validate_name("stream", stream)?;
        validate_name("consumer", consumer)?;
        let subject = api::delete_consumer_subject(prefix, stream, consumer);
        let result: Result<SuccessResponse> =
            api::request_json(self.connection(), &subject, Vec::new(), wait).await;
        match result {
            Ok(resp) if resp.success => Ok(()),
            Ok(_) => Err(Error::IllegalState(format!(
                "delete of consumer '{consumer}' did not succeed"
            ))),
            Err(Error::Api { code: 404, .. }) => Err(Error::NotFound),
            Err(err) => Err(err),
        }
    }

    /// Purge messages from a stream. Explicit options override the purge
    /// options the context was configured with.
    pub async fn purge_stream(
        &self,
        stream: &str,
        purge: Option<&PurgeOptions>,
        call: &CallOptions,
    ) -> Result<u64> {
        validate_name("stream", stream)?;
        let (prefix, wait) = self.resolve(call);
        let opts = purge.unwrap_or(&self.inner.purge);
        let payload = serde_json::to_vec(&PurgeRequest {
            filter: opts.subject.as_deref(),
            seq: (opts.sequence > 0).then_some(opts.sequence),
            keep: (opts.keep > 0).then_some(opts.keep),
        })?;
        let resp: api::PurgeResponse = api::request_json(
            self.connection(),
            &api::purge_subject(&prefix, stream),
            payload,
            wait,
        )
        .await?;
        if !resp.success {
            return Err(Error::IllegalState(format!(
                "purge of stream '{stream}' did not succeed"
            )));
        }
        Ok(resp.purged)
    }

    pub async fn stream_info(&self, stream: &str, call: &CallOptions) -> Result<StreamInfo> {
        validate_name("stream", stream)?;
        let (prefix, wait) = self.resolve(call);
        let payload = serde_json::to_vec(&StreamInfoRequest {
            deleted_details: self.inner.deleted_details,
        })?;
        api::request_json(
            self.connection(),
            &api::stream_info_subject(&prefix, stream),
            payload,
            wait,
        )
        .await
    }

    pub(crate) async fn lookup_stream_by_subject(
        &self,
        subject: &str,
        prefix: &str,
        wait: Duration,
    ) -> Result<String> {
        let payload = serde_json::to_vec(&StreamNamesRequest { subject })?;
        let resp: StreamNamesResponse = api::request_json(
            self.connection(),
            &api::stream_names_subject(prefix),
            payload,
            wait,
        )
        .await?;
        resp.streams
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoStreamMatch(subject.to_string()))
    }
}

pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.contains(char::is_whitespace) {
        return Err(Error::InvalidArg(format!("invalid {kind} name '{name}'")));
    }
    Ok(())
}
