use std::{collections::HashSet, time::Duration};

use anyhow::{Error, Result, anyhow, bail};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::provider::{SENDGRID_PROVIDER, SMTP_PROVIDER},
    dispatcher::DispatchSettings,
    models::{
        circuit_breaker::CircuitBreakerConfig, provider::SenderIdentity, retry::RetryConfig,
    },
};

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusSink {
    #[default]
    Queue,
    Log,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_email_queue_name")]
    pub email_queue_name: String,
    #[serde(default = "default_status_queue_name")]
    pub status_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default)]
    pub requeue_on_failure: bool,
    #[serde(default)]
    pub status_sink: StatusSink,

    pub template_service_url: String,
    #[serde(default = "default_template_fetch_timeout_ms")]
    pub template_fetch_timeout_ms: u64,
    #[serde(default)]
    pub fallback_language: Option<String>,

    #[serde(default = "default_email_providers")]
    pub email_providers: Vec<String>,
    pub sender_email: String,
    pub sender_name: String,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_use_tls: bool,
    #[serde(default = "default_smtp_pool_size")]
    pub smtp_pool_size: u32,
    #[serde(default = "default_smtp_rate_limit_per_second")]
    pub smtp_rate_limit_per_second: u32,
    #[serde(default = "default_smtp_connection_timeout_ms")]
    pub smtp_connection_timeout_ms: u64,

    #[serde(default)]
    pub sendgrid_api_key: Option<String>,
    #[serde(default = "default_sendgrid_api_url")]
    pub sendgrid_api_url: String,
    #[serde(default = "default_sendgrid_rate_limit_per_second")]
    pub sendgrid_rate_limit_per_second: u32,
    #[serde(default = "default_sendgrid_request_timeout_ms")]
    pub sendgrid_request_timeout_ms: u64,

    #[serde(default = "default_circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout_ms: u64,
    #[serde(default = "default_circuit_breaker_error_threshold_percentage")]
    pub circuit_breaker_error_threshold_percentage: u8,
    #[serde(default = "default_circuit_breaker_reset_timeout_ms")]
    pub circuit_breaker_reset_timeout_ms: u64,
    #[serde(default = "default_circuit_breaker_rolling_window_ms")]
    pub circuit_breaker_rolling_window_ms: u64,
    #[serde(default = "default_circuit_breaker_window_buckets")]
    pub circuit_breaker_window_buckets: u32,
    #[serde(default = "default_circuit_breaker_volume_threshold")]
    pub circuit_breaker_volume_threshold: u32,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    #[serde(default)]
    pub message_deadline_ms: Option<u64>,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Per-provider circuit breaker settings, read from `<PROVIDER>_CIRCUIT_BREAKER_*`.
#[derive(Clone, Deserialize, Debug, Default)]
pub struct CircuitBreakerOverrides {
    pub timeout_ms: Option<u64>,
    pub error_threshold_percentage: Option<u8>,
    pub reset_timeout_ms: Option<u64>,
    pub rolling_window_ms: Option<u64>,
    pub window_buckets: Option<u32>,
    pub volume_threshold: Option<u32>,
}

fn default_email_queue_name() -> String {
    "email.queue".to_string()
}
fn default_status_queue_name() -> String {
    "notification.status".to_string()
}
fn default_prefetch_count() -> u16 {
    10
}
fn default_consumer_tag() -> String {
    "email_worker".to_string()
}
fn default_max_redeliveries() -> u32 {
    3
}
fn default_template_fetch_timeout_ms() -> u64 {
    5000
}
fn default_email_providers() -> Vec<String> {
    vec![SMTP_PROVIDER.to_string()]
}
fn default_smtp_host() -> String {
    "localhost".to_string()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_smtp_pool_size() -> u32 {
    5
}
fn default_smtp_rate_limit_per_second() -> u32 {
    5
}
fn default_smtp_connection_timeout_ms() -> u64 {
    10_000
}
fn default_sendgrid_api_url() -> String {
    "https://api.sendgrid.com/v3".to_string()
}
fn default_sendgrid_rate_limit_per_second() -> u32 {
    10
}
fn default_sendgrid_request_timeout_ms() -> u64 {
    10_000
}
fn default_circuit_breaker_timeout_ms() -> u64 {
    3000
}
fn default_circuit_breaker_error_threshold_percentage() -> u8 {
    50
}
fn default_circuit_breaker_reset_timeout_ms() -> u64 {
    30_000
}
fn default_circuit_breaker_rolling_window_ms() -> u64 {
    10_000
}
fn default_circuit_breaker_window_buckets() -> u32 {
    10
}
fn default_circuit_breaker_volume_threshold() -> u32 {
    5
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_retry_jitter() -> f64 {
    0.1
}
fn default_worker_concurrency() -> usize {
    10
}
fn default_server_port() -> u16 {
    3000
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.email_providers.is_empty() {
            bail!("EMAIL_PROVIDERS must name at least one provider");
        }

        let mut seen = HashSet::new();
        for provider in &self.email_providers {
            if provider != SMTP_PROVIDER && provider != SENDGRID_PROVIDER {
                bail!("Unknown email provider '{}'", provider);
            }
            if !seen.insert(provider.as_str()) {
                bail!("Email provider '{}' listed more than once", provider);
            }
        }

        if seen.contains(SENDGRID_PROVIDER) && self.sendgrid_api_key.is_none() {
            bail!("SENDGRID_API_KEY is required when sendgrid is enabled");
        }

        if self.circuit_breaker_error_threshold_percentage > 100 {
            bail!("CIRCUIT_BREAKER_ERROR_THRESHOLD_PERCENTAGE must be within 0..=100");
        }

        if self.circuit_breaker_window_buckets == 0 {
            bail!("CIRCUIT_BREAKER_WINDOW_BUCKETS must be greater than zero");
        }

        if self.max_retry_attempts == 0 {
            bail!("MAX_RETRY_ATTEMPTS must be greater than zero");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            bail!("RETRY_JITTER must be within 0.0..=1.0");
        }

        if self.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be greater than zero");
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            jitter: self.retry_jitter,
        }
    }

    /// Global breaker settings with `<PROVIDER>_CIRCUIT_BREAKER_*` overrides applied.
    pub fn circuit_breaker_config(&self, provider_id: &str) -> Result<CircuitBreakerConfig, Error> {
        let prefix = format!("{}_CIRCUIT_BREAKER_", provider_id.to_uppercase());
        let overrides = envy::prefixed(prefix.as_str())
            .from_env::<CircuitBreakerOverrides>()
            .map_err(|e| anyhow!("Invalid {}* variable: {}", prefix, e))?;

        let config = self.apply_overrides(&overrides);

        if config.error_threshold_percentage > 100 || config.window_buckets == 0 {
            bail!("Invalid circuit breaker settings for provider '{}'", provider_id);
        }

        Ok(config)
    }

    pub fn apply_overrides(&self, overrides: &CircuitBreakerOverrides) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(
                overrides.timeout_ms.unwrap_or(self.circuit_breaker_timeout_ms),
            ),
            error_threshold_percentage: overrides
                .error_threshold_percentage
                .unwrap_or(self.circuit_breaker_error_threshold_percentage),
            reset_timeout: Duration::from_millis(
                overrides
                    .reset_timeout_ms
                    .unwrap_or(self.circuit_breaker_reset_timeout_ms),
            ),
            rolling_window: Duration::from_millis(
                overrides
                    .rolling_window_ms
                    .unwrap_or(self.circuit_breaker_rolling_window_ms),
            ),
            window_buckets: overrides
                .window_buckets
                .unwrap_or(self.circuit_breaker_window_buckets),
            volume_threshold: overrides
                .volume_threshold
                .unwrap_or(self.circuit_breaker_volume_threshold),
        }
    }

    pub fn sender_identity(&self) -> SenderIdentity {
        SenderIdentity::new(self.sender_email.clone(), self.sender_name.clone())
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            sender: self.sender_identity(),
            deadline: self.message_deadline_ms.map(Duration::from_millis),
            fallback_language: self.fallback_language.clone(),
            max_redeliveries: self.max_redeliveries,
            requeue_on_failure: self.requeue_on_failure,
        }
    }
}
