//! Durable streaming client layer over a weir core connection.
//!
//! # Purpose
//! Talks the streaming service's operational contract on behalf of an
//! application: request/reply management calls, asynchronous bounded
//! publish with out-of-band ack correlation, subscription bootstrapping
//! that reconciles caller intent with server-side consumer state, delivery
//! supervision (heartbeats, flow control, sequence gaps), and pull-based
//! fetch.
//!
//! ```
//! use weir_client::{Context, StreamingOptions};
//! use weir_core::Bus;
//!
//! let bus = Bus::new();
//! let ctx = Context::new(bus.connection(), StreamingOptions::default()).expect("context");
//! assert_eq!(ctx.api_prefix(), "$JS.API");
//! ```
mod ack;
mod api;
mod config;
mod context;
mod error;
mod fetch;
mod meta;
mod publish;
mod subscribe;
mod supervisor;

pub use api::{
    err_codes, AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, ReplayPolicy, StreamConfig,
    StreamInfo, StreamState,
};
pub use config::{
    CallOptions, PublishAsyncOptions, PublishErrorHandler, PublishOptions, PurgeOptions,
    StreamInfoOptions, StreamOptions, StreamingOptions, SubscribeOptions, DEFAULT_API_PREFIX,
    DEFAULT_REQUEST_WAIT, DEFAULT_STALL_WAIT,
};
pub use context::Context;
pub use error::{Error, Result};
pub use meta::MessageMetadata;
pub use publish::{
    PubAck, PublishError, EXPECTED_LAST_MSG_ID_HEADER, EXPECTED_LAST_SEQUENCE_HEADER,
    EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER, EXPECTED_STREAM_HEADER, MSG_ID_HEADER,
};
pub use subscribe::{PullSubscription, PushSubscription, SequenceMismatch, StreamMessage};
