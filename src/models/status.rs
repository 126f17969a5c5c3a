use std::fmt::{Display, Formatter, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::FailureKind, models::message::QueueMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl Display for DeliveryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub notification_id: String,
    pub request_id: String,
    pub state: DeliveryState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(message: &QueueMessage, state: DeliveryState) -> Self {
        Self {
            notification_id: message.notification_id.clone(),
            request_id: message.request_id.clone(),
            state,
            provider_id: None,
            external_message_id: None,
            reason: None,
            failure_kind: None,
            timestamp: Utc::now(),
        }
    }

    pub fn pending(message: &QueueMessage) -> Self {
        Self::new(message, DeliveryState::Pending)
    }

    pub fn delivered(
        message: &QueueMessage,
        provider_id: impl Into<String>,
        external_message_id: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(message, DeliveryState::Delivered);
        event.provider_id = Some(provider_id.into());
        event.external_message_id = Some(external_message_id.into());
        event
    }

    pub fn failed(message: &QueueMessage, reason: impl Into<String>, kind: FailureKind) -> Self {
        let mut event = Self::new(message, DeliveryState::Failed);
        event.reason = Some(reason.into());
        event.failure_kind = Some(kind);
        event
    }

    pub fn with_provider(mut self, provider_id: Option<String>) -> Self {
        self.provider_id = provider_id;
        self
    }
}
