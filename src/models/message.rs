use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, models::validation::validate_email_address};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Email,
    Push,
}

/// Wire shape of a queued notification, before validation.
#[derive(Debug, Clone, Deserialize)]
struct QueueMessageDto {
    notification_id: String,
    request_id: String,
    template_code: String,
    notification_type: NotificationType,
    user_id: String,
    #[serde(alias = "user_email")]
    recipient_address: String,
    language: String,
    #[serde(default)]
    variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    priority: i32,
    created_at: String,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMessage {
    pub notification_id: String,
    pub request_id: String,
    pub template_code: String,
    pub notification_type: NotificationType,
    pub user_id: String,
    pub recipient_address: String,
    pub language: String,
    pub variables: HashMap<String, serde_json::Value>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Enqueue-side redelivery count, independent of in-process attempts.
    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl QueueMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, ValidationError> {
        let dto: QueueMessageDto = serde_json::from_slice(payload)?;
        Self::try_from(dto)
    }
}

fn required(field: &'static str, value: String) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::invalid(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

impl TryFrom<QueueMessageDto> for QueueMessage {
    type Error = ValidationError;

    fn try_from(dto: QueueMessageDto) -> Result<Self, Self::Error> {
        if dto.notification_type != NotificationType::Email {
            return Err(ValidationError::invalid(
                "notification_type",
                "only email notifications are handled by this service",
            ));
        }

        let recipient_address = required("recipient_address", dto.recipient_address)?;
        validate_email_address(&recipient_address)
            .map_err(|e| ValidationError::invalid("recipient_address", e.to_string()))?;

        let created_at = DateTime::parse_from_rfc3339(dto.created_at.trim())
            .map_err(|e| ValidationError::invalid("created_at", e.to_string()))?
            .with_timezone(&Utc);

        Ok(Self {
            notification_id: required("notification_id", dto.notification_id)?,
            request_id: required("request_id", dto.request_id)?,
            template_code: required("template_code", dto.template_code)?,
            notification_type: dto.notification_type,
            user_id: required("user_id", dto.user_id)?,
            recipient_address,
            language: required("language", dto.language)?,
            variables: dto.variables,
            priority: dto.priority,
            created_at,
            retry_count: dto.retry_count,
            metadata: dto.metadata,
        })
    }
}
