use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::info;

use crate::{clients::rbmq::RabbitMqClient, models::status::StatusEvent};

/// Sink for delivery lifecycle events. Callers treat failures as non-fatal.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, event: &StatusEvent) -> Result<(), Error>;
}

pub struct RabbitMqStatusReporter {
    rabbitmq: Arc<RabbitMqClient>,
}

impl RabbitMqStatusReporter {
    pub fn new(rabbitmq: Arc<RabbitMqClient>) -> Self {
        Self { rabbitmq }
    }
}

#[async_trait]
impl StatusReporter for RabbitMqStatusReporter {
    async fn report(&self, event: &StatusEvent) -> Result<(), Error> {
        self.rabbitmq.publish_status(event).await
    }
}

/// Writes events to the log only.
#[derive(Debug, Default)]
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(&self, event: &StatusEvent) -> Result<(), Error> {
        info!(
            notification_id = %event.notification_id,
            request_id = %event.request_id,
            state = %event.state,
            provider = ?event.provider_id,
            reason = ?event.reason,
            "Notification status"
        );
        Ok(())
    }
}
