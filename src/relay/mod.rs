//! Message relay: pulls messages off one broker queue and forwards each to the
//! ingestion endpoint, acknowledging according to the configured
//! [`DeliveryPolicy`].
//!
//! The loop moves through `Connecting -> Consuming -> Disconnected -> Connecting`.
//! Only the first connection is fatal; later drops are retried with an
//! exponential backoff. Cancellation is observed between deliveries, never
//! while one is being handled.

pub mod amqp;
pub mod broker;
pub mod ingest;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerError, BrokerSession};
pub use ingest::{IngestionClient, ProcessingResult, ProcessingStatus};

/// Outstanding unacknowledged messages allowed under at-least-once delivery.
pub const AT_LEAST_ONCE_PREFETCH: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeliveryPolicy {
    /// Broker settles each message on dispatch; a failure loses the message.
    FireAndForget,
    /// Relay acks after the ingestion call returns, whatever its outcome.
    #[default]
    AtLeastOnce,
}

impl DeliveryPolicy {
    pub fn requires_explicit_ack(self) -> bool {
        matches!(self, DeliveryPolicy::AtLeastOnce)
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPolicy::FireAndForget => f.write_str("fire-and-forget"),
            DeliveryPolicy::AtLeastOnce => f.write_str("at-least-once"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    /// Survives a broker restart.
    pub durable: bool,
    /// Max unacknowledged deliveries to this consumer; `None` is unlimited.
    pub prefetch: Option<u16>,
}

impl QueueDeclaration {
    /// The declaration each policy runs with.
    pub fn for_policy(name: impl Into<String>, policy: DeliveryPolicy) -> Self {
        match policy {
            DeliveryPolicy::FireAndForget => {
                Self { name: name.into(), durable: false, prefetch: None }
            }
            DeliveryPolicy::AtLeastOnce => Self {
                name: name.into(),
                durable: true,
                prefetch: Some(AT_LEAST_ONCE_PREFETCH),
            },
        }
    }
}

/// One delivery read from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    /// The broker delivered this message before without receiving an ack.
    pub redelivered: bool,
}

/// Reconnect delays: starts at `initial`, doubles, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(500), max: Duration::from_secs(30) }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to build ingestion client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to start relay worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("relay worker exited before it was ready")]
    WorkerLost,
}

enum ConnectionState {
    Connecting,
    Consuming(Box<dyn BrokerSession>),
    Disconnected,
}

pub struct Relay {
    broker: Arc<dyn Broker>,
    ingest: IngestionClient,
    queue: QueueDeclaration,
    policy: DeliveryPolicy,
    backoff: Backoff,
}

impl Relay {
    pub fn new(
        broker: Arc<dyn Broker>,
        ingest: IngestionClient,
        queue: QueueDeclaration,
        policy: DeliveryPolicy,
    ) -> Self {
        Self { broker, ingest, queue, policy, backoff: Backoff::default() }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> &QueueDeclaration {
        &self.queue
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Connect, declare the queue and register as consumer.
    pub async fn open(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let mut session = self.broker.connect().await?;
        let setup = async {
            session.declare(&self.queue).await?;
            session.start_consuming(&self.queue, self.policy).await
        }
        .await;
        if let Err(e) = setup {
            let _ = session.close().await;
            return Err(e);
        }
        info!(
            queue = %self.queue.name,
            durable = self.queue.durable,
            prefetch = ?self.queue.prefetch,
            policy = %self.policy,
            "Consuming from queue"
        );
        Ok(session)
    }

    /// Connect and consume until `cancel` fires.
    ///
    /// A failure to connect or declare on the first attempt is returned to the
    /// caller; the loop never starts.
    pub async fn run_receive_loop(&self, cancel: CancellationToken) -> Result<(), RelayError> {
        let session = self.open().await?;
        self.consume(session, cancel).await;
        Ok(())
    }

    /// Drive an already opened session until cancelled, reconnecting on drops.
    pub async fn consume(&self, session: Box<dyn BrokerSession>, cancel: CancellationToken) {
        let mut state = ConnectionState::Consuming(session);
        let mut delay = self.backoff.initial;

        loop {
            state = match state {
                ConnectionState::Consuming(mut session) => {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        next = session.next_delivery() => Some(next),
                    };
                    let Some(next) = next else {
                        if let Err(e) = session.close().await {
                            warn!(error = %e, "Failed to close broker connection");
                        }
                        break;
                    };
                    match next {
                        Ok(Some(envelope)) => {
                            self.handle_delivery(session.as_mut(), envelope).await;
                            ConnectionState::Consuming(session)
                        }
                        Ok(None) => {
                            warn!(queue = %self.queue.name, "Broker closed the consumer");
                            self.discard(session).await;
                            ConnectionState::Disconnected
                        }
                        Err(e) => {
                            warn!(queue = %self.queue.name, error = %e, "Lost broker connection");
                            self.discard(session).await;
                            ConnectionState::Disconnected
                        }
                    }
                }
                ConnectionState::Disconnected => {
                    info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
                    let cancelled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        break;
                    }
                    delay = self.backoff.next(delay);
                    ConnectionState::Connecting
                }
                ConnectionState::Connecting => {
                    let opened = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        opened = self.open() => Some(opened),
                    };
                    match opened {
                        None => break,
                        Some(Ok(session)) => {
                            delay = self.backoff.initial;
                            ConnectionState::Consuming(session)
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Reconnect failed");
                            ConnectionState::Disconnected
                        }
                    }
                }
            };
        }

        info!(queue = %self.queue.name, "Relay stopped");
    }

    /// Release a session that stopped delivering before reconnecting.
    async fn discard(&self, mut session: Box<dyn BrokerSession>) {
        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close dropped broker connection");
        }
    }

    /// Forward one delivery and settle it per policy. Never fails.
    pub async fn handle_delivery(
        &self,
        session: &mut dyn BrokerSession,
        envelope: MessageEnvelope,
    ) -> ProcessingResult {
        let tag = envelope.delivery_tag;
        debug!(
            delivery_tag = tag,
            redelivered = envelope.redelivered,
            bytes = envelope.payload.len(),
            "Received message"
        );

        let result = self.ingest.forward(&envelope).await;
        let detail = result.detail.as_deref().unwrap_or_default();
        if result.is_success() {
            info!(delivery_tag = tag, "Message processed successfully");
        } else if let Some(status) = result.http_status {
            warn!(delivery_tag = tag, status, detail, "Error processing message");
        } else {
            error!(delivery_tag = tag, detail, "Ingestion endpoint call failed");
        }

        // Failed calls are acked too: no retry, no dead-lettering.
        if self.policy.requires_explicit_ack() {
            if let Err(e) = session.ack(tag).await {
                error!(delivery_tag = tag, error = %e, "Failed to acknowledge message");
            }
        }
        result
    }
}
