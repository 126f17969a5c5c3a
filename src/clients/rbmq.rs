use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tracing::{info, warn};

use crate::{config::Config, models::status::StatusEvent};

/// Settles one queue delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self) -> Result<(), Error>;

    async fn reject(&self, requeue: bool) -> Result<(), Error>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn acknowledge(&self) -> Result<(), Error> {
        self.ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))
    }

    async fn reject(&self, requeue: bool) -> Result<(), Error> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await
        .map(|_| ())
        .map_err(|e| anyhow!("Failed to reject message: {}", e))
    }
}

/// Read-only view of broker connectivity for the health surface.
pub trait BrokerProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    email_queue_name: String,
    status_queue_name: String,
    consumer_tag: String,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|_| anyhow!("RabbitMQ channel creation failed"))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to set up QoS"))?;

        for queue in [&config.email_queue_name, &config.status_queue_name] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|_| anyhow!("Failed to declare queue {}", queue))?;
        }

        info!(
            email_queue = %config.email_queue_name,
            status_queue = %config.status_queue_name,
            prefetch_count = config.prefetch_count,
            "RabbitMQ channel ready"
        );

        Ok(Self {
            connection,
            channel,
            email_queue_name: config.email_queue_name.clone(),
            status_queue_name: config.status_queue_name.clone(),
            consumer_tag: config.consumer_tag.clone(),
        })
    }

    pub async fn create_consumer(&self) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.email_queue_name,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| anyhow!("Failed to create consumer"))?;

        info!(queue = %self.email_queue_name, "Consumer created for queue");

        Ok(consumer)
    }

    pub async fn publish_status(&self, event: &StatusEvent) -> Result<(), Error> {
        let payload = serde_json::to_vec(event)?;

        self.channel
            .basic_publish(
                "",
                &self.status_queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish status event: {}", e))?;

        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "shutdown").await {
            warn!(error = %e, "Failed to close RabbitMQ channel");
        }
        if let Err(e) = self.connection.close(200, "shutdown").await {
            warn!(error = %e, "Failed to close RabbitMQ connection");
        }
        info!("RabbitMQ connection closed");
    }
}

impl BrokerProbe for RabbitMqClient {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
