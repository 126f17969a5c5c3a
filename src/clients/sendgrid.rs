use std::{num::NonZeroU32, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::provider::{EmailProvider, SENDGRID_PROVIDER},
    config::Config,
    models::{
        provider::{ProviderOutcome, SenderIdentity},
        sendgrid::{Content, EmailAddress, Personalization, SendGridErrorBody, SendGridRequest},
        template::RenderedContent,
    },
};

#[derive(Debug, Clone)]
pub struct SendGridSettings {
    pub api_key: String,
    pub api_url: String,
    pub rate_limit_per_second: u32,
    pub request_timeout: Duration,
}

impl SendGridSettings {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let api_key = config
            .sendgrid_api_key
            .clone()
            .ok_or_else(|| anyhow!("SENDGRID_API_KEY is required when sendgrid is enabled"))?;

        Ok(Self {
            api_key,
            api_url: config.sendgrid_api_url.trim_end_matches('/').to_string(),
            rate_limit_per_second: config.sendgrid_rate_limit_per_second,
            request_timeout: Duration::from_millis(config.sendgrid_request_timeout_ms),
        })
    }
}

/// Transactional-email HTTP API transport.
pub struct SendGridProvider {
    http_client: Client,
    limiter: DefaultDirectRateLimiter,
    settings: SendGridSettings,
}

impl SendGridProvider {
    pub fn new(settings: SendGridSettings) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        let per_second = NonZeroU32::new(settings.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);

        info!(api_url = %settings.api_url, "SendGrid client initialized");

        Ok(Self {
            http_client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            settings,
        })
    }

    fn build_request(
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
    ) -> SendGridRequest {
        let mut parts = Vec::with_capacity(2);
        if let Some(text) = &content.text {
            parts.push(Content {
                content_type: "text/plain".to_string(),
                value: text.clone(),
            });
        }
        parts.push(Content {
            content_type: "text/html".to_string(),
            value: content.html.clone(),
        });

        SendGridRequest {
            personalizations: vec![Personalization {
                to: vec![EmailAddress {
                    email: recipient.to_string(),
                    name: None,
                }],
            }],
            from: EmailAddress {
                email: sender.email.clone(),
                name: Some(sender.name.clone()),
            },
            subject: content.subject.clone(),
            content: parts,
        }
    }
}

/// Maps an HTTP failure status onto the outcome taxonomy.
fn classify_status(status: StatusCode, detail: String) -> ProviderOutcome {
    let reason = format!("SendGrid returned {}: {}", status, detail);

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderOutcome::transient(SENDGRID_PROVIDER, reason)
    } else {
        ProviderOutcome::permanent(SENDGRID_PROVIDER, reason)
    }
}

fn error_detail(body: String) -> String {
    match serde_json::from_str::<SendGridErrorBody>(&body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join(", "),
        _ => body,
    }
}

#[async_trait]
impl EmailProvider for SendGridProvider {
    fn id(&self) -> &str {
        SENDGRID_PROVIDER
    }

    async fn send(
        &self,
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
    ) -> ProviderOutcome {
        let request = Self::build_request(content, recipient, sender);

        debug!(recipient, "Sending email via SendGrid");

        let response = match self
            .http_client
            .post(format!("{}/mail/send", self.settings.api_url))
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(recipient, error = %e, "SendGrid request failed");
                return ProviderOutcome::transient(
                    SENDGRID_PROVIDER,
                    format!("SendGrid request failed: {}", e),
                );
            }
        };

        let status = response.status();

        if status.is_success() {
            let message_id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            info!(recipient, message_id = %message_id, "Email sent via SendGrid");
            return ProviderOutcome::sent(SENDGRID_PROVIDER, message_id);
        }

        let body = response.text().await.unwrap_or_default();
        let outcome = classify_status(status, error_detail(body));

        warn!(recipient, status = %status, outcome = ?outcome, "SendGrid rejected email");
        outcome
    }

    async fn ready(&self) {
        self.limiter.until_ready().await;
    }

    async fn check_health(&self) -> bool {
        let result = self
            .http_client
            .get(format!("{}/scopes", self.settings.api_url))
            .bearer_auth(&self.settings.api_key)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "SendGrid health probe rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "SendGrid health probe failed");
                false
            }
        }
    }
}
