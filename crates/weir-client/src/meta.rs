// Ack-subject metadata parser.
use crate::error::{Error, Result};
use crate::subscribe::StreamMessage;

pub(crate) const ACK_PREFIX: &str = "$JS.ACK.";

/// Delivery metadata encoded in a message's ack subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Absent for v1 subjects and for the `_` placeholder domain.
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    pub num_delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    /// Delivery timestamp, epoch nanoseconds.
    pub timestamp: i64,
    pub num_pending: u64,
}

/// Parse the token section of an ack subject, i.e. everything after
/// `$JS.ACK.`.
///
/// v1 subjects carry 7 tokens here
/// (`<stream>.<consumer>.<delivered>.<sseq>.<dseq>.<ts>.<pending>`),
/// v2 subjects at least 9, prepending `<domain>.<acct hash>` and possibly
/// trailing tokens that are ignored. Any other shape is malformed.
pub(crate) fn parse_ack_tokens(rest: &str) -> Result<MessageMetadata> {
    let invalid = || Error::InvalidAckSubject(format!("{ACK_PREFIX}{rest}"));
    let tokens: Vec<&str> = rest.split('.').collect();
    let normalized: Vec<&str> = match tokens.len() {
        7 => {
            let mut v = vec!["", ""];
            v.extend(&tokens);
            v
        }
        n if n >= 9 => tokens[..9].to_vec(),
        _ => return Err(invalid()),
    };

    // Numeric tokens must be non-negative integers; a sign or any other
    // stray character rejects the whole subject.
    let number = |s: &str| s.parse::<u64>().map_err(|_| invalid());

    let domain = match normalized[0] {
        "" | "_" => None,
        d => Some(d.to_string()),
    };
    Ok(MessageMetadata {
        domain,
        stream: normalized[2].to_string(),
        consumer: normalized[3].to_string(),
        num_delivered: number(normalized[4])?,
        stream_sequence: number(normalized[5])?,
        consumer_sequence: number(normalized[6])?,
        timestamp: number(normalized[7])? as i64,
        num_pending: number(normalized[8])?,
    })
}

pub(crate) fn parse_metadata(reply: &str) -> Result<MessageMetadata> {
    let rest = reply
        .strip_prefix(ACK_PREFIX)
        .ok_or_else(|| Error::InvalidAckSubject(reply.to_string()))?;
    parse_ack_tokens(rest)
}

impl StreamMessage {
    /// Delivery metadata parsed from the message's ack subject.
    pub fn metadata(&self) -> Result<MessageMetadata> {
        let reply = self
            .message
            .reply
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::IllegalState("message does not carry an acknowledgment subject".to_string())
            })?;
        parse_metadata(reply)
    }
}
