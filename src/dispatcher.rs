use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, bail};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    clients::{
        provider::ProviderHandle,
        status::StatusReporter,
        template::{TemplateResolver, render},
    },
    error::{DispatchError, TemplateError},
    models::{
        message::QueueMessage,
        provider::{DispatchAttemptLog, ProviderOutcome, SenderIdentity},
        status::StatusEvent,
        template::{RenderedContent, Template},
    },
    retry::{DeadlineExceeded, RetryCoordinator},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Received,
    Rendering,
    Delivering,
    Delivered,
    Failed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Received => "received",
            DispatchState::Rendering => "rendering",
            DispatchState::Delivering => "delivering",
            DispatchState::Delivered => "delivered",
            DispatchState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub sender: SenderIdentity,
    pub deadline: Option<Duration>,
    pub fallback_language: Option<String>,
    /// Enqueue-side `retry_count` at which a failed message is acknowledged
    /// instead of handed back to the broker.
    pub max_redeliveries: u32,
    pub requeue_on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub state: DispatchState,
    pub outcome: Result<ProviderOutcome, DispatchError>,
    pub ack: AckDecision,
    pub rendered: Option<RenderedContent>,
    pub attempts: DispatchAttemptLog,
}

impl DispatchReport {
    pub fn is_delivered(&self) -> bool {
        self.state == DispatchState::Delivered
    }
}

pub struct Dispatcher {
    templates: TemplateResolver,
    coordinator: RetryCoordinator,
    providers: Vec<ProviderHandle>,
    reporter: Arc<dyn StatusReporter>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        templates: TemplateResolver,
        coordinator: RetryCoordinator,
        providers: Vec<ProviderHandle>,
        reporter: Arc<dyn StatusReporter>,
        settings: DispatchSettings,
    ) -> Result<Self, Error> {
        if providers.is_empty() {
            bail!("Dispatcher requires at least one email provider");
        }

        Ok(Self {
            templates,
            coordinator,
            providers,
            reporter,
            settings,
        })
    }

    /// Runs one message through render, delivery and status reporting. Never
    /// fails: every terminal outcome is reported and mapped to an ack decision.
    pub async fn dispatch(&self, message: &QueueMessage) -> DispatchReport {
        let started = Instant::now();
        let deadline = self.settings.deadline.map(|d| started + d);
        let mut attempts = DispatchAttemptLog::new();

        self.enter(message, DispatchState::Received);
        self.enter(message, DispatchState::Rendering);

        let rendered = match self.render_message(message).await {
            Ok(rendered) => rendered,
            Err(e) => {
                let error = DispatchError::from(e);
                return self.fail(message, error, None, attempts).await;
            }
        };

        self.enter(message, DispatchState::Delivering);
        self.report(StatusEvent::pending(message)).await;

        let result = self
            .coordinator
            .attempt_delivery_until(
                &rendered,
                &message.recipient_address,
                &self.settings.sender,
                &self.providers,
                deadline,
                &mut attempts,
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(DeadlineExceeded { last_outcome }) => {
                warn!(
                    notification_id = %message.notification_id,
                    attempts = attempts.len(),
                    last_provider = ?last_outcome.as_ref().map(|o| o.provider_id().to_string()),
                    "Dispatch deadline exceeded, abandoning retries"
                );
                let error = DispatchError::DeadlineExceeded {
                    deadline: self.settings.deadline.unwrap_or_default(),
                };
                return self.fail(message, error, Some(rendered), attempts).await;
            }
        };

        match outcome {
            ProviderOutcome::Sent {
                ref provider_id,
                ref external_message_id,
            } => {
                self.enter(message, DispatchState::Delivered);
                self.report(StatusEvent::delivered(message, provider_id, external_message_id))
                    .await;

                info!(
                    notification_id = %message.notification_id,
                    request_id = %message.request_id,
                    provider = %provider_id,
                    attempts = attempts.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Notification delivered"
                );

                DispatchReport {
                    state: DispatchState::Delivered,
                    outcome: Ok(outcome.clone()),
                    ack: AckDecision::Ack,
                    rendered: Some(rendered),
                    attempts,
                }
            }
            ProviderOutcome::TransientFailure {
                provider_id,
                reason,
            } => {
                let error = DispatchError::TransientProvider {
                    provider_id,
                    reason,
                };
                self.fail(message, error, Some(rendered), attempts).await
            }
            ProviderOutcome::PermanentFailure {
                provider_id,
                reason,
            } => {
                let error = DispatchError::PermanentProvider {
                    provider_id,
                    reason,
                };
                self.fail(message, error, Some(rendered), attempts).await
            }
        }
    }

    async fn render_message(&self, message: &QueueMessage) -> Result<RenderedContent, TemplateError> {
        let template = self.resolve_template(message).await?;
        render(&template, &message.variables)
    }

    async fn resolve_template(&self, message: &QueueMessage) -> Result<Template, TemplateError> {
        let code = &message.template_code;

        match self.templates.resolve(code, &message.language).await {
            Err(TemplateError::NotFound { .. }) => match &self.settings.fallback_language {
                Some(fallback) if fallback != &message.language => {
                    debug!(
                        template_code = %code,
                        language = %message.language,
                        fallback = %fallback,
                        "Template not found, trying fallback language"
                    );
                    self.templates.resolve(code, fallback).await
                }
                _ => Err(TemplateError::NotFound {
                    code: code.clone(),
                    language: message.language.clone(),
                }),
            },
            result => result,
        }
    }

    async fn fail(
        &self,
        message: &QueueMessage,
        error: DispatchError,
        rendered: Option<RenderedContent>,
        attempts: DispatchAttemptLog,
    ) -> DispatchReport {
        self.enter(message, DispatchState::Failed);

        let event = StatusEvent::failed(message, error.to_string(), error.kind())
            .with_provider(error.provider_id().map(str::to_string));
        self.report(event).await;

        let ack = self.ack_decision(message, &error);

        warn!(
            notification_id = %message.notification_id,
            request_id = %message.request_id,
            error = %error,
            kind = ?error.kind(),
            retry_count = message.retry_count,
            ack = ?ack,
            "Notification failed"
        );

        DispatchReport {
            state: DispatchState::Failed,
            outcome: Err(error),
            ack,
            rendered,
            attempts,
        }
    }

    /// Data errors are dead-lettered and never requeued. Store outages and
    /// deadlines always go back to the broker; provider failures are
    /// acknowledged once the enqueue-side redelivery budget is spent.
    fn ack_decision(&self, message: &QueueMessage, error: &DispatchError) -> AckDecision {
        let nack = AckDecision::Nack {
            requeue: self.settings.requeue_on_failure,
        };

        match error {
            DispatchError::Template(e) if e.is_data_error() => AckDecision::Nack { requeue: false },
            DispatchError::Template(_) | DispatchError::DeadlineExceeded { .. } => nack,
            _ if message.retry_count >= self.settings.max_redeliveries => AckDecision::Ack,
            _ => nack,
        }
    }

    async fn report(&self, event: StatusEvent) {
        if let Err(e) = self.reporter.report(&event).await {
            warn!(
                notification_id = %event.notification_id,
                state = %event.state,
                error = %e,
                "Failed to report notification status"
            );
        }
    }

    fn enter(&self, message: &QueueMessage, state: DispatchState) {
        debug!(
            notification_id = %message.notification_id,
            request_id = %message.request_id,
            state = state.as_str(),
            "Dispatch state"
        );
    }
}
