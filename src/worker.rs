use std::{future::Future, sync::Arc};

use anyhow::{Error, Result, anyhow};
use futures_util::StreamExt;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    clients::rbmq::{Acknowledger, RabbitMqClient},
    dispatcher::{AckDecision, DispatchReport, Dispatcher},
    models::message::QueueMessage,
};

/// Parses, dispatches and settles a single delivery.
///
/// Returns `None` when the payload was rejected before dispatch.
pub async fn handle_delivery(
    dispatcher: &Dispatcher,
    payload: &[u8],
    acker: &dyn Acknowledger,
) -> Option<DispatchReport> {
    let message = match QueueMessage::parse(payload) {
        Ok(message) => message,
        Err(e) => {
            // Redelivering an invalid payload can never succeed.
            warn!(error = %e, payload_bytes = payload.len(), "Rejecting invalid queue message");
            if let Err(ack_err) = acker.reject(false).await {
                error!(error = %ack_err, "Failed to reject invalid message");
            }
            return None;
        }
    };

    let report = dispatcher.dispatch(&message).await;

    let settled = match report.ack {
        AckDecision::Ack => acker.acknowledge().await,
        AckDecision::Nack { requeue } => acker.reject(requeue).await,
    };

    if let Err(e) = settled {
        error!(
            notification_id = %message.notification_id,
            ack = ?report.ack,
            error = %e,
            "Failed to settle queue message"
        );
    }

    Some(report)
}

/// Consumes the email queue until `shutdown` flips, processing up to
/// `concurrency` messages at once, then waits for in-flight work to finish.
pub async fn run_worker(
    rabbitmq: Arc<RabbitMqClient>,
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut consumer = rabbitmq.create_consumer().await?;
    let permits = Arc::new(Semaphore::new(concurrency));

    info!(concurrency, "Email worker started");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => {
                info!("Shutdown requested, stopping consumer");
                break;
            }
            delivery = consumer.next() => delivery,
        };

        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(error = %e, "Failed to receive delivery");
                continue;
            }
            None => {
                warn!("Consumer stream ended");
                break;
            }
        };

        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("Worker semaphore closed"))?;
        let dispatcher = Arc::clone(&dispatcher);

        tokio::spawn(async move {
            handle_delivery(&dispatcher, &delivery.data, &delivery.acker).await;
            drop(permit);
        });
    }

    let in_flight = u32::try_from(concurrency).unwrap_or(u32::MAX);
    let _drained = permits
        .acquire_many(in_flight)
        .await
        .map_err(|_| anyhow!("Worker semaphore closed"))?;

    info!("Email worker drained in-flight messages");

    Ok(())
}

/// Awaits the worker, then signals shutdown so the API server stops too, even
/// when the worker returned on its own (consumer lost, consume failed).
pub async fn supervise<W>(
    worker: W,
    api: JoinHandle<Result<(), Error>>,
    shutdown: &watch::Sender<bool>,
) -> Result<(), Error>
where
    W: Future<Output = Result<(), Error>>,
{
    let worker_result = worker.await;

    if !*shutdown.borrow() {
        match &worker_result {
            Ok(()) => warn!("Email worker stopped without a shutdown request"),
            Err(e) => error!(error = %e, "Email worker failed"),
        }
    }
    shutdown.send_replace(true);

    match api.await {
        Ok(Err(e)) => error!(error = %e, "Health check server failed"),
        Err(e) => error!(error = %e, "Health check server task panicked"),
        Ok(Ok(())) => {}
    }

    worker_result
}
