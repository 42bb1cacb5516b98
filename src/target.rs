use async_trait::async_trait;

use crate::buffer::BodyBuffer;
use crate::header::Header;
use crate::message::MessageMeta;
use crate::status::SmtpStatus;

/// Sink for per-recipient outcomes of a non-atomic body delivery.
pub trait StatusCollector: Send {
    fn set_status(&mut self, rcpt: &str, result: Result<(), SmtpStatus>);

    /// Apply `result` to every routed recipient without an explicit status.
    fn set_remaining(&mut self, result: Result<(), SmtpStatus>);
}

/// Anything a message can be handed to for delivery: the remote client, the
/// retry queue, a storage backend, or another dispatch pipeline.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Short identifier used in logs and delivery status reports.
    fn name(&self) -> &str;

    /// Begin a delivery for one message. The returned object accumulates
    /// recipients, then takes the body, then commits or aborts.
    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpStatus>;
}

/// One in-progress delivery. Calls arrive strictly in the order
/// `add_rcpt* < body < commit | abort`; exactly one of `commit`/`abort` is
/// called for every successfully started delivery.
#[async_trait]
pub trait Delivery: Send {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus>;

    /// Atomic body delivery: an error means none of the recipients of this
    /// delivery received the message.
    async fn body(&mut self, header: &Header, body: &dyn BodyBuffer) -> Result<(), SmtpStatus>;

    /// Whether this delivery can report per-recipient outcomes through
    /// [`Delivery::body_non_atomic`]. Probed once per delivery.
    fn status_collection(&self) -> bool {
        false
    }

    /// Non-atomic body delivery. Outcomes are reported through `collector`,
    /// never as a return value. Only called when
    /// [`Delivery::status_collection`] returns true.
    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &Header,
        body: &dyn BodyBuffer,
    ) {
        let result = self.body(header, body).await;
        collector.set_remaining(result);
    }

    async fn commit(&mut self) -> Result<(), SmtpStatus>;

    async fn abort(&mut self) -> Result<(), SmtpStatus>;
}
