use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{
    clients::{provider::ProviderHandle, rbmq::BrokerProbe},
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    },
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthChecker {
    broker: Arc<dyn BrokerProbe>,
    providers: Vec<ProviderHandle>,
}

impl HealthChecker {
    pub fn new(broker: Arc<dyn BrokerProbe>, providers: Vec<ProviderHandle>) -> Self {
        Self { broker, providers }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        checks.insert("message_broker".to_string(), self.check_broker());

        let provider_checks = join_all(self.providers.iter().map(|p| self.check_provider(p))).await;

        let any_provider_usable = provider_checks.iter().any(|(_, health)| {
            health.status == HealthStatus::Healthy
                || (health.status == HealthStatus::Degraded
                    && health.circuit_breaker != Some(CircuitState::Open))
        });

        let aggregate = if any_provider_usable {
            ServiceHealth::healthy(0)
        } else {
            ServiceHealth::unhealthy("No email provider is available".to_string())
        };
        checks.insert("email_providers".to_string(), aggregate);

        for (id, health) in provider_checks {
            checks.insert(format!("provider:{}", id), health);
        }

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    fn check_broker(&self) -> ServiceHealth {
        if self.broker.is_connected() {
            ServiceHealth::healthy(0)
        } else {
            warn!("RabbitMQ connection is down");
            ServiceHealth::unhealthy("Connection lost".to_string())
        }
    }

    async fn check_provider(&self, handle: &ProviderHandle) -> (String, ServiceHealth) {
        let id = handle.id().to_string();
        let state = handle.breaker.state();
        let start = Instant::now();

        let reachable = timeout(PROBE_TIMEOUT, handle.provider.check_health())
            .await
            .unwrap_or(false);

        let elapsed = start.elapsed().as_millis() as u64;

        debug!(
            provider = %id,
            reachable,
            circuit_state = state.as_str(),
            response_time_ms = elapsed,
            "Provider health checked"
        );

        let health = match (reachable, state) {
            (true, CircuitState::Closed) => ServiceHealth::healthy(elapsed),
            (true, CircuitState::HalfOpen) => {
                ServiceHealth::degraded("Circuit breaker in recovery mode".to_string())
            }
            (true, CircuitState::Open) => ServiceHealth::degraded("Circuit breaker is open".to_string()),
            (false, _) => ServiceHealth::unhealthy("Health probe failed".to_string()),
        };

        (id, health.with_circuit_breaker(state))
    }
}

/// Broker down or no usable provider is unhealthy; any other impairment degrades.
fn determine_overall_status(checks: &BTreeMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = checks
        .iter()
        .filter(|(name, _)| name.as_str() == "message_broker" || name.as_str() == "email_providers")
        .any(|(_, health)| health.status == HealthStatus::Unhealthy);

    let impaired = checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if impaired {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
