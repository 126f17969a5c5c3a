use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Sent {
        provider_id: String,
        external_message_id: String,
    },
    TransientFailure {
        provider_id: String,
        reason: String,
    },
    PermanentFailure {
        provider_id: String,
        reason: String,
    },
}

impl ProviderOutcome {
    pub fn sent(provider_id: impl Into<String>, external_message_id: impl Into<String>) -> Self {
        ProviderOutcome::Sent {
            provider_id: provider_id.into(),
            external_message_id: external_message_id.into(),
        }
    }

    pub fn transient(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ProviderOutcome::TransientFailure {
            provider_id: provider_id.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ProviderOutcome::PermanentFailure {
            provider_id: provider_id.into(),
            reason: reason.into(),
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            ProviderOutcome::Sent { provider_id, .. }
            | ProviderOutcome::TransientFailure { provider_id, .. }
            | ProviderOutcome::PermanentFailure { provider_id, .. } => provider_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, ProviderOutcome::Sent { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderOutcome::TransientFailure { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderOutcome::PermanentFailure { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub email: String,
    pub name: String,
}

impl SenderIdentity {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }

    pub fn mailbox(&self) -> String {
        format!("\"{}\" <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchAttempt {
    pub provider_id: String,
    pub outcome: ProviderOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Ordered record of every provider attempt made for one message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchAttemptLog {
    attempts: Vec<DispatchAttempt>,
}

impl DispatchAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: &ProviderOutcome) {
        self.attempts.push(DispatchAttempt {
            provider_id: outcome.provider_id().to_string(),
            outcome: outcome.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn attempts(&self) -> &[DispatchAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn last(&self) -> Option<&DispatchAttempt> {
        self.attempts.last()
    }

    pub fn count_for(&self, provider_id: &str) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.provider_id == provider_id)
            .count()
    }
}
