use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use email_service::{
    clients::{
        circuit_breaker::CircuitBreaker,
        provider::{EmailProvider, ProviderHandle},
        rbmq::{Acknowledger, BrokerProbe},
        status::StatusReporter,
        template::{InMemoryTemplateStore, TemplateResolver},
    },
    dispatcher::{DispatchSettings, Dispatcher},
    models::{
        circuit_breaker::CircuitBreakerConfig,
        message::QueueMessage,
        provider::{ProviderOutcome, SenderIdentity},
        retry::RetryConfig,
        status::{DeliveryState, StatusEvent},
        template::{RenderedContent, Template},
    },
    retry::RetryCoordinator,
};
use parking_lot::Mutex;
use serde_json::json;

/// Provider that replays a script of outcomes, repeating the last one forever.
pub struct StubProvider {
    id: String,
    script: Mutex<VecDeque<ProviderOutcome>>,
    fallback: ProviderOutcome,
    delay: Duration,
    ready_delay: Duration,
    healthy: bool,
    calls: AtomicU32,
    recipients: Mutex<Vec<String>>,
    subjects: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn scripted(id: &str, outcomes: Vec<ProviderOutcome>) -> Self {
        let fallback = outcomes
            .last()
            .cloned()
            .unwrap_or_else(|| ProviderOutcome::sent(id, format!("{}-msg", id)));

        Self {
            id: id.to_string(),
            script: Mutex::new(outcomes.into()),
            fallback,
            delay: Duration::ZERO,
            ready_delay: Duration::ZERO,
            healthy: true,
            calls: AtomicU32::new(0),
            recipients: Mutex::new(Vec::new()),
            subjects: Mutex::new(Vec::new()),
        }
    }

    pub fn sending(id: &str) -> Self {
        Self::scripted(id, vec![ProviderOutcome::sent(id, format!("{}-msg", id))])
    }

    pub fn failing(id: &str) -> Self {
        Self::scripted(id, vec![ProviderOutcome::transient(id, "connection refused")])
    }

    pub fn rejecting(id: &str) -> Self {
        Self::scripted(id, vec![ProviderOutcome::permanent(id, "mailbox does not exist")])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn throttled(mut self, ready_delay: Duration) -> Self {
        self.ready_delay = ready_delay;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subjects.lock().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.recipients.lock().clone()
    }
}

#[async_trait]
impl EmailProvider for StubProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ready(&self) {
        if !self.ready_delay.is_zero() {
            tokio::time::sleep(self.ready_delay).await;
        }
    }

    async fn send(
        &self,
        content: &RenderedContent,
        recipient: &str,
        _sender: &SenderIdentity,
    ) -> ProviderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recipients.lock().push(recipient.to_string());
        self.subjects.lock().push(content.subject.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn check_health(&self) -> bool {
        self.healthy
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<StatusEvent>>,
    fail: bool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broken() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }

    pub fn states(&self) -> Vec<DeliveryState> {
        self.events.lock().iter().map(|e| e.state).collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, event: &StatusEvent) -> Result<(), Error> {
        if self.fail {
            return Err(anyhow!("status queue unavailable"));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected { requeue: bool },
}

#[derive(Default)]
pub struct RecordingAcker {
    settlements: Mutex<Vec<Settlement>>,
}

impl RecordingAcker {
    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn acknowledge(&self) -> Result<(), Error> {
        self.settlements.lock().push(Settlement::Acked);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), Error> {
        self.settlements.lock().push(Settlement::Rejected { requeue });
        Ok(())
    }
}

pub struct StubBroker {
    pub connected: bool,
}

impl BrokerProbe for StubBroker {
    fn is_connected(&self) -> bool {
        self.connected
    }
}

pub fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        timeout: Duration::from_millis(500),
        error_threshold_percentage: 50,
        reset_timeout: Duration::from_millis(200),
        rolling_window: Duration::from_secs(10),
        window_buckets: 10,
        volume_threshold: 4,
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 50,
        max_delay_ms: 1000,
        jitter: 0.0,
    }
}

pub fn handle(provider: Arc<StubProvider>, config: CircuitBreakerConfig) -> ProviderHandle {
    let breaker = Arc::new(CircuitBreaker::new(provider.id().to_string(), config));
    ProviderHandle::new(provider, breaker)
}

pub fn sender() -> SenderIdentity {
    SenderIdentity::new("noreply@example.com", "Example")
}

pub fn content() -> RenderedContent {
    RenderedContent {
        subject: "Hi John".to_string(),
        html: "<p>Hello John</p>".to_string(),
        text: Some("Hello John".to_string()),
    }
}

pub fn welcome_templates() -> InMemoryTemplateStore {
    InMemoryTemplateStore::with_templates([
        Template::new(
            "welcome",
            "en",
            "Hi {{name}}",
            "<p>Hello {{name}}, visit {{link}}</p>",
        ),
        Template::new(
            "welcome",
            "fr",
            "Salut {{name}}",
            "<p>Bonjour {{name}}, visitez {{link}}</p>",
        ),
    ])
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        sender: sender(),
        deadline: None,
        fallback_language: None,
        max_redeliveries: 3,
        requeue_on_failure: false,
    }
}

pub fn message_payload(overrides: serde_json::Value) -> Vec<u8> {
    let mut base = json!({
        "notification_id": "notif-123",
        "request_id": "req-123",
        "template_code": "welcome",
        "notification_type": "email",
        "user_id": "user-123",
        "user_email": "john@example.com",
        "language": "en",
        "variables": { "name": "John", "link": "https://example.com" },
        "priority": 1,
        "created_at": "2025-01-01T12:00:00Z",
        "retry_count": 0
    });

    if let (Some(base), Some(extra)) = (base.as_object_mut(), overrides.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }

    serde_json::to_vec(&base).expect("payload serializes")
}

pub fn message(overrides: serde_json::Value) -> QueueMessage {
    QueueMessage::parse(&message_payload(overrides)).expect("test message is valid")
}

pub fn dispatcher(
    providers: Vec<ProviderHandle>,
    retry: RetryConfig,
    reporter: Arc<RecordingReporter>,
    settings: DispatchSettings,
) -> Dispatcher {
    Dispatcher::new(
        TemplateResolver::new(Arc::new(welcome_templates())),
        RetryCoordinator::new(retry),
        providers,
        reporter,
        settings,
    )
    .expect("dispatcher has providers")
}
