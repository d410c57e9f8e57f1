//! AMQP 0-9-1 broker backed by `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::broker::{Broker, BrokerError, BrokerSession};
use super::{DeliveryPolicy, MessageEnvelope, QueueDeclaration};

/// Persistent delivery mode for messages published to durable queues.
const PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    async fn open(&self) -> Result<AmqpSession, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(channel = channel.id(), "AMQP channel opened");
        Ok(AmqpSession { connection, channel, consumer: None })
    }

    /// Publish one message to the default exchange, routed by queue name.
    ///
    /// The queue is declared first with the same attributes the relay uses.
    pub async fn publish(
        &self,
        queue: &QueueDeclaration,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut session = self.open().await?;
        session.declare(queue).await?;
        let properties = if queue.durable {
            BasicProperties::default().with_delivery_mode(PERSISTENT)
        } else {
            BasicProperties::default()
        };
        session
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        let confirmation = session
            .channel
            .basic_publish("", &queue.name, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        if let Err(e) = settle_confirmation(&queue.name, confirmation) {
            let _ = session.close().await;
            return Err(e);
        }
        info!(queue = %queue.name, bytes = payload.len(), "Published message");
        session.close().await
    }
}

/// Only a broker `ack` counts as published.
fn settle_confirmation(queue: &str, confirmation: Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => {
            Err(BrokerError::Channel(format!("broker rejected publish to '{queue}'")))
        }
        Confirmation::NotRequested => Err(BrokerError::Channel(format!(
            "publish to '{queue}' was not confirmed"
        ))),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        Ok(Box::new(self.open().await?))
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare(&mut self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions { durable: queue.durable, ..Default::default() };
        self.channel
            .queue_declare(&queue.name, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Declaration {
                queue: queue.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn start_consuming(
        &mut self,
        queue: &QueueDeclaration,
        policy: DeliveryPolicy,
    ) -> Result<(), BrokerError> {
        if let Some(prefetch) = queue.prefetch {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
        }
        let options = BasicConsumeOptions {
            no_ack: !policy.requires_explicit_ack(),
            ..Default::default()
        };
        let tag = format!("mqrelay-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(&queue.name, &tag, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<MessageEnvelope>, BrokerError> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| BrokerError::Channel("consumer not started".to_string()))?;
        match consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(BrokerError::Channel(e.to_string())),
            Some(Ok(delivery)) => Ok(Some(MessageEnvelope {
                payload: delivery.data,
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
            })),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.consumer = None;
        self.connection
            .close(200, "relay shutting down")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}
