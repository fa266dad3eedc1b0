// Acknowledgment helpers on delivered messages.
use bytes::Bytes;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::subscribe::StreamMessage;

pub(crate) const ACK_ACK: &[u8] = b"+ACK";
pub(crate) const ACK_NAK: &[u8] = b"-NAK";
pub(crate) const ACK_IN_PROGRESS: &[u8] = b"+WPI";
pub(crate) const ACK_TERM: &[u8] = b"+TERM";

impl StreamMessage {
    /// Positively acknowledge the message. Repeated acknowledgment calls on
    /// the same message are no-ops.
    pub fn ack(&self) -> Result<()> {
        self.send_ack(ACK_ACK, false)
    }

    /// Ask for redelivery.
    pub fn nak(&self) -> Result<()> {
        self.send_ack(ACK_NAK, false)
    }

    /// Reset the server's redelivery clock without consuming the message.
    pub fn in_progress(&self) -> Result<()> {
        self.send_ack(ACK_IN_PROGRESS, true)
    }

    /// Acknowledge and instruct the server not to redeliver, ever.
    pub fn term(&self) -> Result<()> {
        self.send_ack(ACK_TERM, false)
    }

    /// Positively acknowledge and wait for the server to confirm it.
    pub async fn ack_sync(&self) -> Result<()> {
        if self.acked.load(Ordering::Acquire) {
            return Ok(());
        }
        let reply = self.ack_reply()?.to_string();
        let _ = self
            .shared
            .conn()
            .request(&reply, Bytes::from_static(ACK_ACK), self.shared.wait)
            .await?;
        self.acked.store(true, Ordering::Release);
        Ok(())
    }

    fn ack_reply(&self) -> Result<&str> {
        self.message
            .reply
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::IllegalState("message does not carry an acknowledgment subject".to_string())
            })
    }

    fn send_ack(&self, payload: &'static [u8], in_progress: bool) -> Result<()> {
        if self.acked.load(Ordering::Acquire) {
            return Ok(());
        }
        let reply = self.ack_reply()?;
        self.shared
            .conn()
            .publish(reply, Bytes::from_static(payload))?;
        // Work-in-progress leaves the message open for a later final ack.
        if !in_progress {
            self.acked.store(true, Ordering::Release);
        }
        Ok(())
    }
}
