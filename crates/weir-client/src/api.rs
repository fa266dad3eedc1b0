//! API request helper and the typed request/response payloads.
//!
//! Every management operation is a request on a prefixed subject whose JSON
//! reply wraps the payload in an envelope with an optional `error` object.
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use weir_core::Connection;
use weir_wire::Message;

use crate::error::{Error, Result};

/// Server error codes the layer branches on.
pub mod err_codes {
    pub const CONSUMER_NOT_FOUND: u16 = 10014;
    pub const STREAM_NOT_FOUND: u16 = 10059;
    pub const NOT_ENABLED: u16 = 10076;
    pub const CONSUMER_EXISTING_ACTIVE: u16 = 10105;
    pub const CONSUMER_NAME_EXIST: u16 = 10148;
}

#[derive(Debug, Clone, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    err_code: u16,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct ApiEnvelope {
    error: Option<ApiError>,
}

/// Decode an API reply: surface the envelope error if present, otherwise
/// decode the payload itself.
pub(crate) fn parse_response<T: DeserializeOwned>(msg: &Message) -> Result<T> {
    parse_error_only(msg)?;
    Ok(serde_json::from_slice(&msg.payload)?)
}

/// Check an API reply for an envelope error without decoding a payload.
pub(crate) fn parse_error_only(msg: &Message) -> Result<()> {
    if msg.is_no_responders() {
        return Err(Error::NoResponders);
    }
    let envelope: ApiEnvelope = serde_json::from_slice(&msg.payload)?;
    if let Some(err) = envelope.error {
        return Err(Error::Api {
            code: err.code,
            err_code: err.err_code,
            description: err.description,
        });
    }
    Ok(())
}

pub(crate) async fn request_json<T: DeserializeOwned>(
    conn: &Connection,
    subject: &str,
    payload: Vec<u8>,
    wait: Duration,
) -> Result<T> {
    let resp = conn.request(subject, Bytes::from(payload), wait).await?;
    parse_response(&resp)
}

// Management subjects, relative to the API prefix.

pub(crate) fn stream_names_subject(prefix: &str) -> String {
    format!("{prefix}.STREAM.NAMES")
}

pub(crate) fn stream_info_subject(prefix: &str, stream: &str) -> String {
    format!("{prefix}.STREAM.INFO.{stream}")
}

pub(crate) fn purge_subject(prefix: &str, stream: &str) -> String {
    format!("{prefix}.STREAM.PURGE.{stream}")
}

pub(crate) fn consumer_info_subject(prefix: &str, stream: &str, consumer: &str) -> String {
    format!("{prefix}.CONSUMER.INFO.{stream}.{consumer}")
}

pub(crate) fn create_consumer_subject(prefix: &str, stream: &str, durable: Option<&str>) -> String {
    match durable {
        Some(durable) => format!("{prefix}.CONSUMER.DURABLE.CREATE.{stream}.{durable}"),
        None => format!("{prefix}.CONSUMER.CREATE.{stream}"),
    }
}

pub(crate) fn delete_consumer_subject(prefix: &str, stream: &str, consumer: &str) -> String {
    format!("{prefix}.CONSUMER.DELETE.{stream}.{consumer}")
}

pub(crate) fn next_msg_subject(prefix: &str, stream: &str, consumer: &str) -> String {
    format!("{prefix}.CONSUMER.MSG.NEXT.{stream}.{consumer}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    None,
    All,
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    Instant,
    Original,
}

/// Consumer configuration. Unset fields keep the server's defaults; the
/// subscription factory only rejects an attach when an explicitly set field
/// disagrees with the existing consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_policy: Option<DeliverPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    /// Epoch nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_policy: Option<AckPolicy>,
    /// Nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_policy: Option<ReplayPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_bps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_freq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flow_control: bool,
    /// Nanoseconds between server heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
    /// True when a push consumer already has an active subscription.
    #[serde(default)]
    pub push_bound: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    #[serde(default)]
    pub state: StreamState,
    /// Sequences of deleted messages, when requested with deleted details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Vec<u64>>,
}

#[derive(Serialize)]
pub(crate) struct CreateConsumerRequest<'a> {
    pub stream_name: &'a str,
    pub config: &'a ConsumerConfig,
}

#[derive(Serialize)]
pub(crate) struct StreamNamesRequest<'a> {
    pub subject: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct StreamNamesResponse {
    #[serde(default)]
    pub streams: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub(crate) struct SuccessResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Serialize)]
pub(crate) struct StreamInfoRequest {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted_details: bool,
}

#[derive(Serialize)]
pub(crate) struct PurgeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<u64>,
}

#[derive(Deserialize)]
pub(crate) struct PurgeResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub purged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_error_is_surfaced() {
        let msg = Message::new(
            "_INBOX.reply",
            r#"{"type":"io.weir.api.v1.consumer_info_response","error":{"code":404,"err_code":10014,"description":"consumer not found"}}"#,
        );
        let err = parse_response::<ConsumerInfo>(&msg).expect_err("error envelope");
        match err {
            Error::Api {
                code,
                err_code,
                description,
            } => {
                assert_eq!(code, 404);
                assert_eq!(err_code, 10014);
                assert_eq!(description, "consumer not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn payload_decodes_when_no_error() {
        let info = ConsumerInfo {
            stream_name: "ORDERS".to_string(),
            name: "pusher".to_string(),
            config: ConsumerConfig {
                durable_name: Some("pusher".to_string()),
                ack_policy: Some(AckPolicy::Explicit),
                ..ConsumerConfig::default()
            },
            push_bound: false,
        };
        let msg = Message::new("_INBOX.reply", serde_json::to_vec(&info).expect("encode"));
        let decoded: ConsumerInfo = parse_response(&msg).expect("decode");
        assert_eq!(decoded.name, "pusher");
        assert_eq!(decoded.config.ack_policy, Some(AckPolicy::Explicit));
    }

    #[test]
    fn no_responders_reply_maps_to_error() {
        let msg = Message::status_message("_INBOX.reply", weir_wire::STATUS_NO_RESPONDERS, "No Responders");
        assert!(matches!(
            parse_error_only(&msg),
            Err(Error::NoResponders)
        ));
    }

    #[test]
    fn management_subjects() {
        assert_eq!(stream_names_subject("$JS.API"), "$JS.API.STREAM.NAMES");
        assert_eq!(
            consumer_info_subject("$JS.API", "ORDERS", "pusher"),
            "$JS.API.CONSUMER.INFO.ORDERS.pusher"
        );
        assert_eq!(
            create_consumer_subject("$JS.API", "ORDERS", Some("pusher")),
            "$JS.API.CONSUMER.DURABLE.CREATE.ORDERS.pusher"
        );
        assert_eq!(
            create_consumer_subject("$JS.API", "ORDERS", None),
            "$JS.API.CONSUMER.CREATE.ORDERS"
        );
        assert_eq!(
            next_msg_subject("$JS.hub.API", "ORDERS", "puller"),
            "$JS.hub.API.CONSUMER.MSG.NEXT.ORDERS.puller"
        );
    }

    #[test]
    fn consumer_config_omits_unset_fields() {
        let cfg = ConsumerConfig {
            durable_name: Some("dur".to_string()),
            ..ConsumerConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("encode");
        assert_eq!(json, r#"{"durable_name":"dur"}"#);
    }

    #[test]
    fn policies_use_snake_case_names() {
        assert_eq!(
            serde_json::to_string(&DeliverPolicy::ByStartSequence).expect("encode"),
            r#""by_start_sequence""#
        );
        assert_eq!(
            serde_json::to_string(&AckPolicy::Explicit).expect("encode"),
            r#""explicit""#
        );
        assert_eq!(
            serde_json::to_string(&ReplayPolicy::Instant).expect("encode"),
            r#""instant""#
        );
    }
}
