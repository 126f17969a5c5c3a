use std::{sync::Arc, time::Duration};

use anyhow::Result;
use email_service::{
    clients::template::{InMemoryTemplateStore, TemplateResolver},
    dispatcher::{AckDecision, DispatchState, Dispatcher},
    error::{DispatchError, FailureKind, TemplateError},
    models::{
        provider::ProviderOutcome,
        retry::RetryConfig,
        status::DeliveryState,
        template::Template,
    },
    retry::RetryCoordinator,
    worker::handle_delivery,
};
use serde_json::json;

use crate::common::{
    RecordingAcker, RecordingReporter, Settlement, StubProvider, breaker_config, dispatcher,
    fast_retry, handle, message, message_payload, settings,
};

/// Test: A welcome email renders, delivers and reports pending then delivered
#[tokio::test]
async fn test_end_to_end_delivery() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let report = dispatcher.dispatch(&message(json!({}))).await;

    assert!(report.is_delivered());
    assert_eq!(report.ack, AckDecision::Ack);
    assert_eq!(report.outcome, Ok(ProviderOutcome::sent("smtp", "smtp-msg")));

    let rendered = report.rendered.expect("content was rendered");
    assert_eq!(rendered.subject, "Hi John");
    assert_eq!(rendered.html, "<p>Hello John, visit https://example.com</p>");
    assert_eq!(rendered.text.as_deref(), Some("Hello John, visit https://example.com"));

    assert_eq!(provider.recipients(), vec!["john@example.com".to_string()]);
    assert_eq!(reporter.states(), vec![DeliveryState::Pending, DeliveryState::Delivered]);

    let delivered = &reporter.events()[1];
    assert_eq!(delivered.notification_id, "notif-123");
    assert_eq!(delivered.request_id, "req-123");
    assert_eq!(delivered.provider_id.as_deref(), Some("smtp"));
    assert_eq!(delivered.external_message_id.as_deref(), Some("smtp-msg"));

    Ok(())
}

/// Test: Delivery fails over to the secondary provider inside one dispatch
#[tokio::test]
async fn test_failover_reports_secondary_provider() -> Result<()> {
    let primary = Arc::new(StubProvider::failing("smtp"));
    let secondary = Arc::new(StubProvider::sending("sendgrid"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![
            handle(Arc::clone(&primary), breaker_config()),
            handle(Arc::clone(&secondary), breaker_config()),
        ],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let report = dispatcher.dispatch(&message(json!({}))).await;

    assert!(report.is_delivered());
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 1);
    assert_eq!(reporter.events()[1].provider_id.as_deref(), Some("sendgrid"));

    Ok(())
}

/// Test: An open circuit fails the message without touching the provider
#[tokio::test]
async fn test_open_circuit_skips_provider() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let mut config = breaker_config();
    config.reset_timeout = Duration::from_secs(60);
    let smtp = handle(Arc::clone(&provider), config);

    for _ in 0..4 {
        let _ = smtp
            .breaker
            .call(|| async { ProviderOutcome::transient("smtp", "connection refused") })
            .await;
    }

    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![smtp],
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: 0.0,
        },
        Arc::clone(&reporter),
        settings(),
    );

    let report = dispatcher.dispatch(&message(json!({}))).await;

    assert_eq!(report.state, DispatchState::Failed);
    assert_eq!(provider.calls(), 0, "Open circuit must not reach the provider");
    assert!(matches!(
        report.outcome,
        Err(DispatchError::TransientProvider { ref provider_id, .. }) if provider_id == "smtp"
    ));
    assert_eq!(report.ack, AckDecision::Nack { requeue: false });

    let events = reporter.events();
    assert_eq!(reporter.states(), vec![DeliveryState::Pending, DeliveryState::Failed]);
    assert_eq!(events[1].failure_kind, Some(FailureKind::Transient));
    assert!(
        events[1]
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("Circuit breaker is open"))
    );

    Ok(())
}

/// Test: Redelivered messages are sent again; deduplication is upstream
#[tokio::test]
async fn test_duplicate_messages_are_delivered_twice() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let message = message(json!({}));
    assert!(dispatcher.dispatch(&message).await.is_delivered());
    assert!(dispatcher.dispatch(&message).await.is_delivered());

    let delivered = reporter
        .states()
        .into_iter()
        .filter(|s| *s == DeliveryState::Delivered)
        .count();
    assert_eq!(delivered, 2);
    assert_eq!(provider.calls(), 2);

    Ok(())
}

/// Test: Unknown templates fail fast as data errors with no pending event
#[tokio::test]
async fn test_missing_template_is_data_error() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let report = dispatcher
        .dispatch(&message(json!({ "template_code": "password_reset" })))
        .await;

    assert_eq!(report.state, DispatchState::Failed);
    assert_eq!(
        report.outcome,
        Err(DispatchError::Template(TemplateError::NotFound {
            code: "password_reset".to_string(),
            language: "en".to_string(),
        }))
    );
    assert_eq!(report.ack, AckDecision::Nack { requeue: false });
    assert!(report.rendered.is_none());
    assert!(report.attempts.is_empty());
    assert_eq!(provider.calls(), 0);

    let events = reporter.events();
    assert_eq!(reporter.states(), vec![DeliveryState::Failed]);
    assert_eq!(events[0].failure_kind, Some(FailureKind::DataError));

    Ok(())
}

/// Test: A placeholder without a variable fails rendering
#[tokio::test]
async fn test_missing_variable_is_data_error() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let report = dispatcher
        .dispatch(&message(json!({ "variables": { "link": "https://example.com" } })))
        .await;

    assert_eq!(
        report.outcome,
        Err(DispatchError::Template(TemplateError::VariableMissing("name".to_string())))
    );
    assert_eq!(provider.calls(), 0);
    // Even an exhausted redelivery budget does not ack data errors.
    let report = dispatcher
        .dispatch(&message(json!({ "variables": {}, "retry_count": 10 })))
        .await;
    assert_eq!(report.ack, AckDecision::Nack { requeue: false });

    Ok(())
}

/// Test: A missing translation falls back to the configured language
#[tokio::test]
async fn test_fallback_language_is_used() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let mut with_fallback = settings();
    with_fallback.fallback_language = Some("en".to_string());

    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        with_fallback,
    );

    let report = dispatcher.dispatch(&message(json!({ "language": "de" }))).await;
    assert!(report.is_delivered());
    assert_eq!(provider.subjects(), vec!["Hi John".to_string()]);

    let report = dispatcher.dispatch(&message(json!({ "language": "fr" }))).await;
    assert!(report.is_delivered());
    assert_eq!(provider.subjects()[1], "Salut John");

    Ok(())
}

/// Test: Without a fallback the requested language is reported as missing
#[tokio::test]
async fn test_no_fallback_reports_requested_language() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let dispatcher = dispatcher(
        vec![handle(provider, breaker_config())],
        fast_retry(3),
        Arc::new(RecordingReporter::new()),
        settings(),
    );

    let report = dispatcher.dispatch(&message(json!({ "language": "de" }))).await;

    assert!(matches!(
        report.outcome,
        Err(DispatchError::Template(TemplateError::NotFound { ref language, .. })) if language == "de"
    ));

    Ok(())
}

/// Test: Provider failures are acked once the redelivery budget is spent
#[tokio::test]
async fn test_retry_count_gates_acknowledgement() -> Result<()> {
    let provider = Arc::new(StubProvider::rejecting("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let fresh = dispatcher.dispatch(&message(json!({ "retry_count": 0 }))).await;
    assert_eq!(fresh.ack, AckDecision::Nack { requeue: false });
    assert!(matches!(fresh.outcome, Err(DispatchError::PermanentProvider { .. })));

    let spent = dispatcher.dispatch(&message(json!({ "retry_count": 3 }))).await;
    assert_eq!(spent.ack, AckDecision::Ack);

    let failed = reporter.events().into_iter().last().expect("failure reported");
    assert_eq!(failed.state, DeliveryState::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::Permanent));
    assert_eq!(failed.provider_id.as_deref(), Some("smtp"));

    Ok(())
}

/// Test: Failures go back to the broker with requeue when configured
#[tokio::test]
async fn test_requeue_on_failure_setting() -> Result<()> {
    let provider = Arc::new(StubProvider::failing("smtp"));
    let mut requeue = settings();
    requeue.requeue_on_failure = true;

    let dispatcher = dispatcher(
        vec![handle(provider, breaker_config())],
        fast_retry(1),
        Arc::new(RecordingReporter::new()),
        requeue,
    );

    let report = dispatcher.dispatch(&message(json!({}))).await;
    assert_eq!(report.ack, AckDecision::Nack { requeue: true });

    Ok(())
}

/// Test: Data errors are never requeued, even when failures requeue
#[tokio::test]
async fn test_data_errors_ignore_requeue_setting() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let mut requeue = settings();
    requeue.requeue_on_failure = true;

    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(1),
        Arc::new(RecordingReporter::new()),
        requeue,
    );

    let missing_template = dispatcher
        .dispatch(&message(json!({ "template_code": "nope" })))
        .await;
    assert!(matches!(
        missing_template.outcome,
        Err(DispatchError::Template(TemplateError::NotFound { .. }))
    ));
    assert_eq!(missing_template.ack, AckDecision::Nack { requeue: false });

    let missing_variable = dispatcher
        .dispatch(&message(json!({ "variables": {} })))
        .await;
    assert_eq!(missing_variable.ack, AckDecision::Nack { requeue: false });
    assert_eq!(provider.calls(), 0);

    Ok(())
}

/// Test: The per-message deadline abandons remaining retries
#[tokio::test]
async fn test_deadline_exceeded_fails_message() -> Result<()> {
    let provider = Arc::new(StubProvider::failing("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let mut with_deadline = settings();
    with_deadline.deadline = Some(Duration::from_millis(100));

    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 1000,
            jitter: 0.0,
        },
        Arc::clone(&reporter),
        with_deadline,
    );

    let report = dispatcher
        .dispatch(&message(json!({ "retry_count": 10 })))
        .await;

    assert_eq!(
        report.outcome,
        Err(DispatchError::DeadlineExceeded {
            deadline: Duration::from_millis(100)
        })
    );
    assert_eq!(report.ack, AckDecision::Nack { requeue: false });
    assert_eq!(provider.calls(), 1);
    assert_eq!(
        reporter.events().last().and_then(|e| e.failure_kind),
        Some(FailureKind::DeadlineExceeded)
    );

    Ok(())
}

/// Test: Status reporting failures never fail the delivery
#[tokio::test]
async fn test_reporter_failure_is_not_fatal() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let dispatcher = dispatcher(
        vec![handle(provider, breaker_config())],
        fast_retry(3),
        Arc::new(RecordingReporter::broken()),
        settings(),
    );

    let report = dispatcher.dispatch(&message(json!({}))).await;
    assert!(report.is_delivered());
    assert_eq!(report.ack, AckDecision::Ack);

    Ok(())
}

/// Test: A dispatcher cannot be built without providers
#[tokio::test]
async fn test_dispatcher_requires_providers() -> Result<()> {
    let result = Dispatcher::new(
        TemplateResolver::new(Arc::new(InMemoryTemplateStore::new())),
        RetryCoordinator::new(fast_retry(1)),
        vec![],
        Arc::new(RecordingReporter::new()),
        settings(),
    );

    assert!(result.is_err());

    Ok(())
}

/// Test: Invalid payloads are rejected without requeue and never dispatched
#[tokio::test]
async fn test_invalid_payload_is_rejected() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = dispatcher(
        vec![handle(Arc::clone(&provider), breaker_config())],
        fast_retry(3),
        Arc::clone(&reporter),
        settings(),
    );

    let acker = RecordingAcker::default();
    let report = handle_delivery(&dispatcher, b"{ not json", &acker).await;
    assert!(report.is_none());

    let bad_address = message_payload(json!({ "user_email": "not-an-email" }));
    let report = handle_delivery(&dispatcher, &bad_address, &acker).await;
    assert!(report.is_none());

    assert_eq!(
        acker.settlements(),
        vec![
            Settlement::Rejected { requeue: false },
            Settlement::Rejected { requeue: false },
        ]
    );
    assert_eq!(provider.calls(), 0);
    assert!(reporter.events().is_empty());

    Ok(())
}

/// Test: Valid payloads are dispatched and settled from the report
#[tokio::test]
async fn test_valid_payload_is_acknowledged() -> Result<()> {
    let provider = Arc::new(StubProvider::sending("smtp"));
    let dispatcher = dispatcher(
        vec![handle(provider, breaker_config())],
        fast_retry(3),
        Arc::new(RecordingReporter::new()),
        settings(),
    );

    let acker = RecordingAcker::default();
    let report = handle_delivery(&dispatcher, &message_payload(json!({})), &acker).await;

    assert!(report.is_some_and(|r| r.is_delivered()));
    assert_eq!(acker.settlements(), vec![Settlement::Acked]);

    Ok(())
}

/// Test: Templates with a plain text skeleton keep it instead of stripped html
#[tokio::test]
async fn test_text_skeleton_is_rendered() -> Result<()> {
    let store = InMemoryTemplateStore::with_templates([Template::new(
        "receipt",
        "en",
        "Order {{order.id}}",
        "<p>Total: {{order.total}}</p>",
    )
    .with_text("Total {{order.total}} for order {{order.id}}")]);

    let provider = Arc::new(StubProvider::sending("smtp"));
    let dispatcher = Dispatcher::new(
        TemplateResolver::new(Arc::new(store)),
        RetryCoordinator::new(fast_retry(1)),
        vec![handle(provider, breaker_config())],
        Arc::new(RecordingReporter::new()),
        settings(),
    )?;

    let report = dispatcher
        .dispatch(&message(json!({
            "template_code": "receipt",
            "variables": { "order": { "id": "A-42", "total": 19.5 } }
        })))
        .await;

    let rendered = report.rendered.expect("content was rendered");
    assert_eq!(rendered.subject, "Order A-42");
    assert_eq!(rendered.html, "<p>Total: 19.5</p>");
    assert_eq!(rendered.text.as_deref(), Some("Total 19.5 for order A-42"));

    Ok(())
}
