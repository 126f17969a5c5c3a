use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tracing::info;

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        sendgrid::{SendGridProvider, SendGridSettings},
        smtp::{SmtpProvider, SmtpSettings},
    },
    config::Config,
    models::{
        provider::{ProviderOutcome, SenderIdentity},
        template::RenderedContent,
    },
};

/// Uniform capability over heterogeneous email transports.
///
/// Implementations map transport errors into [`ProviderOutcome`] and must be safe
/// to call from many in-flight dispatches at once.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn send(
        &self,
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
    ) -> ProviderOutcome;

    /// Waits out any local send-rate limit. Runs before the breaker admits the
    /// call, so throttling never counts against the send timeout.
    async fn ready(&self) {}

    /// Lightweight liveness probe; never sends a message.
    async fn check_health(&self) -> bool;

    async fn close(&self) {}
}

/// An adapter paired with the breaker that gates it.
#[derive(Clone)]
pub struct ProviderHandle {
    pub provider: Arc<dyn EmailProvider>,
    pub breaker: Arc<CircuitBreaker>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn EmailProvider>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { provider, breaker }
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }
}

pub const SMTP_PROVIDER: &str = "smtp";
pub const SENDGRID_PROVIDER: &str = "sendgrid";

/// Opens every configured provider in priority order.
pub async fn build_providers(config: &Config) -> Result<Vec<ProviderHandle>, Error> {
    let mut handles = Vec::with_capacity(config.email_providers.len());

    for provider_id in &config.email_providers {
        let provider: Arc<dyn EmailProvider> = match provider_id.as_str() {
            SMTP_PROVIDER => Arc::new(SmtpProvider::open(SmtpSettings::from_config(config)).await?),
            SENDGRID_PROVIDER => Arc::new(SendGridProvider::new(SendGridSettings::from_config(config)?)?),
            other => return Err(anyhow!("Unknown email provider '{}'", other)),
        };

        let breaker = Arc::new(CircuitBreaker::new(
            provider_id.clone(),
            config.circuit_breaker_config(provider_id)?,
        ));

        handles.push(ProviderHandle::new(provider, breaker));
    }

    info!(
        providers = ?config.email_providers,
        "Email providers initialized in priority order"
    );

    Ok(handles)
}

pub async fn close_providers(handles: &[ProviderHandle]) {
    for handle in handles {
        handle.provider.close().await;
    }
}
