use std::{num::NonZeroU32, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, MultiPart, SinglePart, header::ContentType},
    transport::smtp::{self, PoolConfig, authentication::Credentials},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::provider::{EmailProvider, SMTP_PROVIDER},
    config::Config,
    models::{
        provider::{ProviderOutcome, SenderIdentity},
        template::RenderedContent,
    },
};

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub pool_size: u32,
    pub rate_limit_per_second: u32,
    pub connection_timeout: Duration,
}

impl SmtpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: config.smtp_username.clone(),
            password: config.smtp_password.clone(),
            use_tls: config.smtp_use_tls,
            pool_size: config.smtp_pool_size,
            rate_limit_per_second: config.smtp_rate_limit_per_second,
            connection_timeout: Duration::from_millis(config.smtp_connection_timeout_ms),
        }
    }
}

/// Pooled SMTP transport.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    limiter: DefaultDirectRateLimiter,
    settings: SmtpSettings,
}

impl SmtpProvider {
    /// Builds the transport without touching the network.
    pub fn new(settings: SmtpSettings) -> Result<Self, Error> {
        let transport = Self::build_transport(&settings)?;
        let per_second = NonZeroU32::new(settings.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);

        info!(
            host = %settings.host,
            port = settings.port,
            pool_size = settings.pool_size,
            "SMTP transporter initialized"
        );

        Ok(Self {
            transport,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            settings,
        })
    }

    /// Builds the transport and warms up the pool. A failed warm-up is logged
    /// and retried implicitly by the first send.
    pub async fn open(settings: SmtpSettings) -> Result<Self, Error> {
        let provider = Self::new(settings)?;

        match provider.transport.test_connection().await {
            Ok(true) => info!("SMTP connection verified and pool warmed up"),
            Ok(false) => warn!("SMTP warmup did not verify the connection, will retry on first send"),
            Err(e) => warn!(error = %e, "SMTP warmup failed, will retry on first send"),
        }

        Ok(provider)
    }

    fn build_transport(settings: &SmtpSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>, Error> {
        let mut builder = if settings.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .map_err(|e| anyhow!("Failed to create SMTP relay: {}", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };

        builder = builder
            .port(settings.port)
            .timeout(Some(settings.connection_timeout))
            .pool_config(PoolConfig::new().max_size(settings.pool_size.max(1)));

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    fn build_message(
        &self,
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
        message_id: &str,
    ) -> Result<Message, ProviderOutcome> {
        let from: Mailbox = sender
            .mailbox()
            .parse()
            .map_err(|e| self.permanent(format!("Invalid sender address: {}", e)))?;

        let to: Mailbox = recipient
            .parse()
            .map_err(|e| self.permanent(format!("Invalid recipient address: {}", e)))?;

        let text = content
            .text
            .clone()
            .unwrap_or_else(|| content.html.clone());

        Message::builder()
            .from(from)
            .to(to)
            .subject(content.subject.clone())
            .message_id(Some(message_id.to_string()))
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(content.html.clone()),
                    ),
            )
            .map_err(|e| self.permanent(format!("Failed to build email message: {}", e)))
    }

    fn permanent(&self, reason: String) -> ProviderOutcome {
        ProviderOutcome::permanent(SMTP_PROVIDER, reason)
    }
}

/// 5xx replies are permanent; 4xx replies, connection, TLS and timeout errors are not.
fn classify_smtp_error(err: &smtp::Error) -> ProviderOutcome {
    if err.is_permanent() {
        ProviderOutcome::permanent(SMTP_PROVIDER, format!("SMTP rejected message: {}", err))
    } else if err.is_timeout() {
        ProviderOutcome::transient(SMTP_PROVIDER, format!("SMTP timeout: {}", err))
    } else {
        ProviderOutcome::transient(SMTP_PROVIDER, format!("SMTP send failed: {}", err))
    }
}

fn message_id_domain(sender: &SenderIdentity) -> &str {
    sender
        .email
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("localhost")
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    fn id(&self) -> &str {
        SMTP_PROVIDER
    }

    async fn send(
        &self,
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
    ) -> ProviderOutcome {
        let message_id = format!("<{}@{}>", Uuid::new_v4(), message_id_domain(sender));

        let message = match self.build_message(content, recipient, sender, &message_id) {
            Ok(message) => message,
            Err(outcome) => return outcome,
        };

        debug!(
            recipient,
            host = %self.settings.host,
            port = self.settings.port,
            "Sending email via SMTP"
        );

        match self.transport.send(message).await {
            Ok(_) => {
                info!(recipient, message_id = %message_id, "Email sent via SMTP");
                ProviderOutcome::sent(SMTP_PROVIDER, message_id)
            }
            Err(e) => {
                error!(recipient, error = %e, "Failed to send email via SMTP");
                classify_smtp_error(&e)
            }
        }
    }

    async fn ready(&self) {
        self.limiter.until_ready().await;
    }

    async fn check_health(&self) -> bool {
        match self.transport.test_connection().await {
            Ok(verified) => verified,
            Err(e) => {
                warn!(error = %e, "SMTP verification failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.transport.shutdown().await;
        info!("SMTP connection pool closed");
    }
}
