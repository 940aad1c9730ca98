use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::common::RelayConfig;
use crate::models::errors::RelayError;
use crate::models::events::EventRecord;
use crate::relay::{Delivery, RelayConsumer, RelayPublisher};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";
const CONSUMER_TAG: &str = "userop-persister";
const REPLY_SUCCESS: u16 = 200;

/// Opens a connection and a channel, and declares the durable queue both roles share.
async fn open(config: &RelayConfig) -> Result<(Connection, Channel), RelayError> {
    let uri = config.uri().map_err(|e| RelayError::Unavailable {
        reason: e.to_string(),
    })?;
    let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    info!(
        "Connected to broker at {}:{}, queue '{}' declared",
        config.host, config.port, config.queue
    );
    Ok((connection, channel))
}

async fn shutdown(connection: &Connection, channel: &Channel) -> Result<(), RelayError> {
    if channel.status().connected() {
        channel.close(REPLY_SUCCESS, "shutdown").await?;
    }
    if connection.status().connected() {
        connection.close(REPLY_SUCCESS, "shutdown").await?;
    }
    info!("Connection to broker closed");
    Ok(())
}

/// Publisher confirms are enabled so `publish` only returns after the broker has taken
/// responsibility for the message.
async fn open_confirmed(config: &RelayConfig) -> Result<(Connection, Channel), RelayError> {
    let (connection, channel) = open(config).await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok((connection, channel))
}

fn is_connected(connection: &Connection, channel: &Channel) -> bool {
    connection.status().connected() && channel.status().connected()
}

pub struct AmqpPublisher {
    config: RelayConfig,
    /// Reopened in place when the broker drops the connection.
    session: Mutex<(Connection, Channel)>,
}

impl AmqpPublisher {
    pub async fn connect(config: &RelayConfig) -> Result<Self, RelayError> {
        let session = open_confirmed(config).await?;
        Ok(Self {
            config: config.clone(),
            session: Mutex::new(session),
        })
    }
}

#[async_trait]
impl RelayPublisher for AmqpPublisher {
    async fn publish(&self, record: &EventRecord) -> Result<(), RelayError> {
        let payload = record.to_json()?;
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(CONTENT_TYPE_JSON.into());

        let mut session = self.session.lock().await;
        if !is_connected(&session.0, &session.1) {
            warn!("Broker connection lost, reopening before publishing {}", record.key());
            *session = open_confirmed(&self.config).await?;
        }

        let confirmation = session
            .1
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_ack() {
            Ok(())
        } else {
            warn!("Broker refused message for {}", record.key());
            Err(RelayError::NotAcknowledged)
        }
    }

    async fn close(&self) -> Result<(), RelayError> {
        let session = self.session.lock().await;
        shutdown(&session.0, &session.1).await
    }
}

/// Prefetch of one keeps a single message in flight, which preserves queue order through
/// requeues.
async fn subscribe(config: &RelayConfig) -> Result<(Connection, Channel, Consumer), RelayError> {
    let (connection, channel) = open(config).await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;
    let consumer = channel
        .basic_consume(
            &config.queue,
            CONSUMER_TAG,
            BasicConsumeOptions {
                no_ack: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok((connection, channel, consumer))
}

pub struct AmqpConsumer {
    config: RelayConfig,
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

impl AmqpConsumer {
    pub async fn connect(config: &RelayConfig) -> Result<Self, RelayError> {
        let (connection, channel, consumer) = subscribe(config).await?;
        Ok(Self {
            config: config.clone(),
            connection,
            channel,
            consumer,
        })
    }
}

#[async_trait]
impl RelayConsumer for AmqpConsumer {
    async fn recv(&mut self) -> Result<Option<Delivery>, RelayError> {
        match self.consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(delivery)) => {
                debug!(
                    "Received delivery {} (redelivered: {})",
                    delivery.delivery_tag, delivery.redelivered
                );
                Ok(Some(Delivery {
                    tag: delivery.delivery_tag,
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                }))
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), RelayError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn requeue(&mut self, tag: u64) -> Result<(), RelayError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn reject(&mut self, tag: u64) -> Result<(), RelayError> {
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), RelayError> {
        if let Err(e) = shutdown(&self.connection, &self.channel).await {
            debug!("Error closing stale broker session: {}", e);
        }
        let (connection, channel, consumer) = subscribe(&self.config).await?;
        self.connection = connection;
        self.channel = channel;
        self.consumer = consumer;
        info!("Consumer reconnected to queue '{}'", self.config.queue);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        shutdown(&self.connection, &self.channel).await
    }
}
