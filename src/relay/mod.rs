//! Durable, ordered, at-least-once hand-off between the listener and the persister.
//!
//! A consumer must settle every [`Delivery`] with exactly one of `ack`, `requeue` or
//! `reject`. Nothing is acknowledged implicitly: a consumer that crashes with a delivery
//! outstanding gets it back from the broker on its next session.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;

use crate::models::errors::RelayError;
use crate::models::events::EventRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    /// Set by the broker when this message was handed out before and not acknowledged.
    pub redelivered: bool,
}

#[async_trait]
pub trait RelayPublisher: Send + Sync {
    /// Returns once the channel has durably accepted the record.
    async fn publish(&self, record: &EventRecord) -> Result<(), RelayError>;

    async fn close(&self) -> Result<(), RelayError>;
}

#[async_trait]
pub trait RelayConsumer: Send {
    /// Waits for the next delivery. `Ok(None)` means the channel was closed.
    async fn recv(&mut self) -> Result<Option<Delivery>, RelayError>;

    async fn ack(&mut self, tag: u64) -> Result<(), RelayError>;

    /// Hands the message back for redelivery in its original position.
    async fn requeue(&mut self, tag: u64) -> Result<(), RelayError>;

    /// Drops the message for good.
    async fn reject(&mut self, tag: u64) -> Result<(), RelayError>;

    /// Replaces a lost session with a fresh one. Deliveries outstanding on the old session
    /// are redelivered by the broker and their tags are no longer valid.
    async fn reconnect(&mut self) -> Result<(), RelayError>;

    async fn close(&mut self) -> Result<(), RelayError>;
}
