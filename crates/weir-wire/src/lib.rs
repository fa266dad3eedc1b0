// Message model shared by the bus and the streaming client layer.
use bytes::Bytes;
use std::collections::HashMap;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
}

/// Status code carried by service-generated messages with no user payload.
pub const STATUS_CONTROL: u16 = 100;
/// No messages available for a pull request.
pub const STATUS_NOT_FOUND: u16 = 404;
/// A pull request expired on the server while interest was still present.
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Nothing was listening on the request subject.
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Headers attached to a message.
///
/// Keys are matched exactly; the conventional header names used by the
/// streaming layer are defined where that layer marshals them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: HashMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let _ = self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Control messages the streaming service interleaves with deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Heartbeat,
    FlowControl,
}

/// A message as carried by the core connection.
///
/// ```
/// use weir_wire::Message;
///
/// let msg = Message::new("orders.created", "payload");
/// assert_eq!(msg.subject, "orders.created");
/// assert!(msg.reply.is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: HeaderMap,
    /// Service status line (404/408/503/100), absent on user messages.
    pub status: Option<u16>,
    pub description: Option<String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// An empty-bodied message carrying only a status line.
    pub fn status_message(subject: impl Into<String>, status: u16, description: &str) -> Self {
        Self {
            subject: subject.into(),
            status: Some(status),
            description: Some(description.to_string()),
            ..Self::default()
        }
    }

    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty() && self.status == Some(STATUS_NO_RESPONDERS)
    }

    /// Classify an empty status-100 message as a heartbeat or a flow
    /// control request. Anything else is not a control message.
    pub fn control_type(&self) -> Option<ControlType> {
        if !self.payload.is_empty() || self.status != Some(STATUS_CONTROL) {
            return None;
        }
        let description = self.description.as_deref()?.trim_start();
        if description.starts_with("Idle") {
            Some(ControlType::Heartbeat)
        } else if description.starts_with("Flow") {
            Some(ControlType::FlowControl)
        } else {
            None
        }
    }
}

/// Validate a subject. Wildcard tokens (`*`, and `>` in final position)
/// are only legal on subscription filters.
pub fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        let valid = match *token {
            "" => false,
            "*" => allow_wildcards,
            ">" => allow_wildcards && i == tokens.len() - 1,
            other => !other.contains(char::is_whitespace),
        };
        if !valid {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}
