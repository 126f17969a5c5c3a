use std::sync::Arc;

use anyhow::{Error, Result};
use email_service::{
    api::run_api_server,
    clients::{
        health::HealthChecker,
        provider::{ProviderHandle, build_providers, close_providers},
        rbmq::{BrokerProbe, RabbitMqClient},
        status::{LogStatusReporter, RabbitMqStatusReporter, StatusReporter},
        template::{TemplateResolver, TemplateServiceClient},
    },
    config::{Config, StatusSink},
    dispatcher::Dispatcher,
    retry::RetryCoordinator,
    utils::init_tracing,
    worker::{run_worker, supervise},
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    info!(
        providers = ?config.email_providers,
        queue = %config.email_queue_name,
        "Configuration validated, starting email service"
    );

    let providers = build_providers(&config).await?;

    let rabbitmq = match RabbitMqClient::connect(&config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            close_providers(&providers).await;
            return Err(e);
        }
    };

    let result = run(&config, Arc::clone(&rabbitmq), providers.clone()).await;

    close_providers(&providers).await;
    rabbitmq.close().await;

    if let Err(e) = &result {
        error!(error = %e, "Email service stopped with error");
    } else {
        info!("Email service stopped");
    }

    result
}

async fn run(
    config: &Config,
    rabbitmq: Arc<RabbitMqClient>,
    providers: Vec<ProviderHandle>,
) -> Result<(), Error> {
    let templates = TemplateResolver::new(Arc::new(TemplateServiceClient::new(config)?));

    let reporter: Arc<dyn StatusReporter> = match config.status_sink {
        StatusSink::Queue => Arc::new(RabbitMqStatusReporter::new(Arc::clone(&rabbitmq))),
        StatusSink::Log => Arc::new(LogStatusReporter),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        templates,
        RetryCoordinator::new(config.retry_config()),
        providers.clone(),
        reporter,
        config.dispatch_settings(),
    )?);

    let broker: Arc<dyn BrokerProbe> = rabbitmq.clone();
    let health_checker = Arc::new(HealthChecker::new(broker, providers));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let api = tokio::spawn(run_api_server(
        config.server_port,
        health_checker,
        shutdown_rx.clone(),
    ));

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        signal_tx.send_replace(true);
    });

    let worker = run_worker(
        rabbitmq,
        dispatcher,
        config.worker_concurrency,
        shutdown_rx,
    );

    supervise(worker, api, &shutdown_tx).await
}
