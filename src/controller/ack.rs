//! Delivery acknowledgement with swallowed failures.
//!
//! A worker that cannot reach the broker to ack should keep working; the
//! broker's redelivery timeout is the safety net for a lost control op. The
//! type makes the protocol hard to misuse: `in_progress` borrows, the
//! terminal ops consume.

use log::warn;
use metrics::counter;

use crate::broker::Message;

const ACK_ERROR_COUNTER: &str = "corral_ack_errors_total";

pub struct Acknowledger {
    msg: Box<dyn Message>,
}

impl Acknowledger {
    pub fn new(msg: Box<dyn Message>) -> Acknowledger {
        Acknowledger { msg }
    }

    pub fn message(&self) -> &dyn Message {
        self.msg.as_ref()
    }

    /// Extend the redelivery deadline while work continues.
    pub async fn in_progress(&self) {
        if let Err(e) = self.msg.in_progress().await {
            counter!(ACK_ERROR_COUNTER, "op" => "in_progress").increment(1);
            warn!("in-progress signal for {} failed: {e}", self.msg.subject());
        }
    }

    /// Work finished; remove the delivery.
    pub async fn complete(self) {
        if let Err(e) = self.msg.ack().await {
            counter!(ACK_ERROR_COUNTER, "op" => "complete").increment(1);
            warn!("ack for {} failed: {e}", self.msg.subject());
        }
    }

    /// Give the delivery back for another worker.
    pub async fn requeue(self) {
        if let Err(e) = self.msg.nak().await {
            counter!(ACK_ERROR_COUNTER, "op" => "requeue").increment(1);
            warn!("nak for {} failed: {e}", self.msg.subject());
        }
    }
}
