//! Seam between the relay loop and a concrete message broker.
//!
//! A [`Broker`] hands out one [`BrokerSession`] per connection. The session is
//! owned exclusively by the relay's worker, so implementations need no locking.

use async_trait::async_trait;

use super::{DeliveryPolicy, MessageEnvelope, QueueDeclaration};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the connection.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The queue exists with attributes that do not match the declaration.
    #[error("queue declaration for '{queue}' failed: {reason}")]
    Declaration { queue: String, reason: String },

    /// An operation on an established channel failed.
    #[error("broker channel error: {0}")]
    Channel(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh connection and channel.
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send {
    /// Ensure the queue exists. Idempotent for matching attributes.
    async fn declare(&mut self, queue: &QueueDeclaration) -> Result<(), BrokerError>;

    /// Register this session as a consumer of `queue`.
    ///
    /// Under [`DeliveryPolicy::FireAndForget`] the broker settles each message
    /// as it is dispatched; otherwise it waits for [`BrokerSession::ack`] and
    /// honours the declaration's prefetch limit.
    async fn start_consuming(
        &mut self,
        queue: &QueueDeclaration,
        policy: DeliveryPolicy,
    ) -> Result<(), BrokerError>;

    /// Wait for the next delivery. `Ok(None)` means the broker closed the consumer.
    async fn next_delivery(&mut self) -> Result<Option<MessageEnvelope>, BrokerError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Close the channel and connection.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
