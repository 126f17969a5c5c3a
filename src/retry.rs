use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{
    clients::provider::ProviderHandle,
    models::{
        circuit_breaker::CircuitState,
        provider::{DispatchAttemptLog, ProviderOutcome, SenderIdentity},
        retry::RetryConfig,
        template::RenderedContent,
    },
};

/// The per-message deadline passed before a terminal outcome was reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("dispatch deadline exceeded")]
pub struct DeadlineExceeded {
    pub last_outcome: Option<ProviderOutcome>,
}

/// Drives delivery across a priority-ordered provider list: failover within a
/// round is immediate, and only an exhausted round waits for backoff.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    config: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn attempt_delivery(
        &self,
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
        providers: &[ProviderHandle],
        log: &mut DispatchAttemptLog,
    ) -> ProviderOutcome {
        match self
            .attempt_delivery_until(content, recipient, sender, providers, None, log)
            .await
        {
            Ok(outcome) => outcome,
            // Unreachable without a deadline, but keep the last known outcome.
            Err(DeadlineExceeded { last_outcome }) => last_outcome
                .unwrap_or_else(|| ProviderOutcome::transient("none", "dispatch deadline exceeded")),
        }
    }

    /// Like [`attempt_delivery`](Self::attempt_delivery), but stops scheduling new
    /// attempts once `deadline` has passed. An attempt already in flight runs to
    /// its own timeout.
    pub async fn attempt_delivery_until(
        &self,
        content: &RenderedContent,
        recipient: &str,
        sender: &SenderIdentity,
        providers: &[ProviderHandle],
        deadline: Option<Instant>,
        log: &mut DispatchAttemptLog,
    ) -> Result<ProviderOutcome, DeadlineExceeded> {
        if providers.is_empty() {
            return Ok(ProviderOutcome::permanent("none", "no email providers configured"));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_outcome: Option<ProviderOutcome> = None;

        for attempt in 0..max_attempts {
            for handle in providers {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(DeadlineExceeded { last_outcome });
                }

                let provider_id = handle.id().to_string();

                if handle.breaker.state() != CircuitState::Open {
                    handle.provider.ready().await;
                }

                let outcome = match handle
                    .breaker
                    .call(|| handle.provider.send(content, recipient, sender))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(open) => {
                        debug!(
                            provider = %provider_id,
                            attempt = attempt + 1,
                            "Skipping provider with open circuit"
                        );
                        ProviderOutcome::transient(provider_id.clone(), open.to_string())
                    }
                };

                log.record(&outcome);

                match &outcome {
                    ProviderOutcome::Sent { external_message_id, .. } => {
                        info!(
                            provider = %provider_id,
                            attempt = attempt + 1,
                            external_message_id = %external_message_id,
                            "Delivery succeeded"
                        );
                        return Ok(outcome);
                    }
                    ProviderOutcome::PermanentFailure { reason, .. } => {
                        warn!(
                            provider = %provider_id,
                            reason = %reason,
                            "Permanent delivery failure, not retrying"
                        );
                        return Ok(outcome);
                    }
                    ProviderOutcome::TransientFailure { reason, .. } => {
                        debug!(
                            provider = %provider_id,
                            attempt = attempt + 1,
                            reason = %reason,
                            "Transient delivery failure, failing over"
                        );
                        last_outcome = Some(outcome);
                    }
                }
            }

            if attempt + 1 >= max_attempts {
                break;
            }

            let delay = self.config.delay_for(attempt);

            if let Some(deadline) = deadline {
                // The next round could not start in time.
                if Instant::now() + delay >= deadline {
                    return Err(DeadlineExceeded { last_outcome });
                }
            }

            debug!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "All providers failed transiently, backing off"
            );

            sleep(delay).await;
        }

        warn!(max_attempts, "Delivery attempts exhausted");

        Ok(last_outcome
            .unwrap_or_else(|| ProviderOutcome::transient("none", "delivery attempts exhausted")))
    }
}
