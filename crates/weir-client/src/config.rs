// Context options and defaults.
use std::sync::Arc;
use std::time::Duration;

use crate::api::ConsumerConfig;
use crate::context::Context;
use crate::publish::PublishError;

/// API subject prefix used when neither a prefix nor a domain is configured.
pub const DEFAULT_API_PREFIX: &str = "$JS.API";

/// Timeout applied to API requests when none is configured.
pub const DEFAULT_REQUEST_WAIT: Duration = Duration::from_millis(5000);

/// How long an asynchronous publish waits for capacity before reporting a
/// stall.
pub const DEFAULT_STALL_WAIT: Duration = Duration::from_millis(200);

/// Applied to created consumers that acknowledge but do not set their own
/// cap on outstanding unacknowledged deliveries.
pub(crate) const DEFAULT_MAX_ACK_PENDING: i64 = 64 * 1024;

/// Invoked for asynchronous publishes that fail after the transport accepted
/// them. The handler owns the failed message; republishing it is the retry
/// path.
pub type PublishErrorHandler = Arc<dyn Fn(&Context, PublishError) + Send + Sync>;

#[derive(Clone, Default)]
pub struct StreamingOptions {
    /// API subject prefix. Ignored when `domain` is set.
    pub prefix: Option<String>,
    /// Streaming domain; expands to `$JS.<domain>.API`.
    pub domain: Option<String>,
    /// Default request wait. Zero or unset selects [`DEFAULT_REQUEST_WAIT`].
    pub wait: Option<Duration>,
    pub publish_async: PublishAsyncOptions,
    pub stream: StreamOptions,
}

#[derive(Clone, Default)]
pub struct PublishAsyncOptions {
    /// Cap on outstanding asynchronous publishes. `None` means unbounded.
    pub max_pending: Option<usize>,
    /// Stall deadline for publishes waiting on capacity. Zero or unset
    /// selects [`DEFAULT_STALL_WAIT`].
    pub stall_wait: Option<Duration>,
    pub error_handler: Option<PublishErrorHandler>,
}

#[derive(Clone, Default)]
pub struct StreamOptions {
    pub purge: PurgeOptions,
    pub info: StreamInfoOptions,
}

#[derive(Clone, Default)]
pub struct PurgeOptions {
    /// Restrict the purge to this subject filter.
    pub subject: Option<String>,
    /// Purge up to, but not including, this sequence.
    pub sequence: u64,
    /// Keep this many most-recent messages.
    pub keep: u64,
}

#[derive(Clone, Default)]
pub struct StreamInfoOptions {
    pub deleted_details: bool,
}

/// Per-call overrides for prefix, domain, and request wait.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub prefix: Option<String>,
    pub domain: Option<String>,
    pub wait: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct PublishOptions {
    pub msg_id: Option<String>,
    pub expect_stream: Option<String>,
    pub expect_last_msg_id: Option<String>,
    pub expect_last_sequence: Option<u64>,
    pub expect_last_subject_sequence: Option<u64>,
    /// Overrides the context wait for this call.
    pub max_wait: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Bind to this stream instead of looking it up by subject.
    pub stream: Option<String>,
    /// Bind to this consumer instead of deriving one from the durable name.
    pub consumer: Option<String>,
    /// Queue group for push subscriptions.
    pub queue: Option<String>,
    /// Suppress the automatic acknowledgment wrapper on handler
    /// subscriptions.
    pub manual_ack: bool,
    pub config: ConsumerConfig,
    pub call: CallOptions,
}

pub(crate) fn strip_trailing_dot(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

pub(crate) fn derive_prefix(domain: Option<&str>, prefix: Option<&str>) -> String {
    if let Some(domain) = domain.filter(|d| !d.is_empty()) {
        format!("$JS.{}.API", strip_trailing_dot(domain))
    } else if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        strip_trailing_dot(prefix).to_string()
    } else {
        DEFAULT_API_PREFIX.to_string()
    }
}
