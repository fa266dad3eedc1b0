//! Pull-based fetch.
//!
//! # Purpose
//! Gathers a batch for a pull subscription: drain whatever already sits in
//! the local queue, then ask the service for the remainder with a request
//! that expires just inside our own deadline. A `no_wait` probe avoids
//! parking server-side when more than one message is still wanted; a 404 on
//! the probe converts it into a blocking request.
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use weir_wire::{Message, STATUS_NOT_FOUND, STATUS_NO_RESPONDERS, STATUS_REQUEST_TIMEOUT};

use crate::error::{Error, Result};
use crate::subscribe::{PullSubscription, StreamMessage};
use crate::supervisor;

/// Pull requests expire this much before the caller's own deadline so the
/// server answers while we are still listening. Applied only when at least
/// twice the margin remains.
pub(crate) const PULL_EXPIRE_MARGIN_MS: u64 = 10;

#[derive(Serialize)]
struct PullRequest {
    batch: usize,
    /// Nanoseconds the request may be parked server-side.
    expires: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_wait: Option<bool>,
}

pub(crate) fn request_expiry_ns(remaining_ms: u64) -> i64 {
    let expires_ms = if remaining_ms >= 2 * PULL_EXPIRE_MARGIN_MS {
        remaining_ms - PULL_EXPIRE_MARGIN_MS
    } else {
        remaining_ms
    };
    (expires_ms as i64) * 1_000_000
}

/// Classify one inbound message. `Ok(true)` is a user message, `Ok(false)`
/// an ignorable status; failures carry the status meaning.
fn check_msg(msg: &Message, check_status: bool) -> Result<bool> {
    if !msg.payload.is_empty() {
        return Ok(true);
    }
    let Some(status) = msg.status else {
        return Ok(true);
    };
    if !check_status {
        return Ok(false);
    }
    match status {
        STATUS_NOT_FOUND => Err(Error::NotFound),
        // An expired server-side request; the caller keeps waiting.
        STATUS_REQUEST_TIMEOUT => Ok(false),
        STATUS_NO_RESPONDERS => Err(Error::NoResponders),
        status => Err(Error::ServerStatus {
            status,
            description: msg
                .description
                .clone()
                .unwrap_or_else(|| "error checking pull subscribe message".to_string()),
        }),
    }
}

impl PullSubscription {
    /// Gather up to `batch` messages, waiting at most `timeout`. A partial
    /// batch is a success; only an empty one surfaces the error.
    pub async fn fetch(&mut self, batch: usize, timeout: Duration) -> Result<Vec<StreamMessage>> {
        if batch == 0 {
            return Err(Error::InvalidArg(
                "batch must be strictly positive".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::with_capacity(batch);

        // Already-delivered messages first; status messages are dropped at
        // this stage.
        while out.len() < batch && self.sub.pending() > 0 {
            let Some(msg) = self.sub.try_next() else {
                break;
            };
            if check_msg(&msg, false)? {
                out.push(self.wrap(msg));
            }
        }
        if out.len() == batch {
            return Ok(out);
        }

        // Probe with no_wait only while a final answer short of the batch
        // would still be useful.
        let mut no_wait = batch - out.len() > 1;
        let mut last_err = self
            .send_pull_request(batch - out.len(), deadline, no_wait)
            .err();

        while last_err.is_none() && out.len() < batch {
            match tokio::time::timeout_at(deadline, self.sub.next()).await {
                Err(_) => last_err = Some(Error::Timeout),
                Ok(None) => {
                    last_err = Some(Error::IllegalState("subscription closed".to_string()))
                }
                Ok(Some(msg)) => match check_msg(&msg, true) {
                    Ok(true) => out.push(self.wrap(msg)),
                    Ok(false) => {}
                    Err(Error::NotFound) if no_wait && out.is_empty() => {
                        // The probe found nothing; ask again and park.
                        no_wait = false;
                        last_err = self.send_pull_request(batch, deadline, false).err();
                    }
                    Err(err) => last_err = Some(err),
                },
            }
        }

        if !out.is_empty() {
            // Partial results win over whatever ended the wait.
            return Ok(out);
        }
        Err(last_err.unwrap_or(Error::Timeout))
    }

    fn send_pull_request(
        &self,
        batch: usize,
        deadline: tokio::time::Instant,
        no_wait: bool,
    ) -> Result<()> {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        let remaining_ms = (deadline - now).as_millis() as u64;
        let subject = self.shared.next_subject.as_deref().ok_or_else(|| {
            Error::IllegalState("pull subscription has no next-message subject".to_string())
        })?;
        let payload = serde_json::to_vec(&PullRequest {
            batch,
            expires: request_expiry_ns(remaining_ms),
            no_wait: no_wait.then_some(true),
        })?;
        self.shared
            .conn()
            .publish_msg(Message::new(subject, payload).with_reply(self.sub.subject()))?;
        Ok(())
    }

    fn wrap(&self, msg: Message) -> StreamMessage {
        supervisor::track_sequences(&self.shared, &msg);
        {
            // Any fetched message counts as liveness for the watchdog.
            self.shared.state().active = true;
        }
        StreamMessage {
            message: msg,
            shared: Arc::clone(&self.shared),
            acked: Arc::new(AtomicBool::new(false)),
        }
    }
}
