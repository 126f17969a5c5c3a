use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Per-call budget; a send still running past it counts as a transient failure.
    pub timeout: Duration,
    pub error_threshold_percentage: u8,
    pub reset_timeout: Duration,
    pub rolling_window: Duration,
    pub window_buckets: u32,
    pub volume_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_millis(30_000),
            rolling_window: Duration::from_millis(10_000),
            window_buckets: 10,
            volume_threshold: 5,
        }
    }
}

/// Read-only projection of a breaker, used by the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub total_calls: u32,
    pub failures: u32,
    pub error_rate: f64,
}
