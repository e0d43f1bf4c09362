//! Queue bridge: consumes worker results and hands them to the manager.
//!
//! One bridge runs per consumed queue. The result queue is bridged with
//! [`DeliveryOutcome::Success`], its dead-letter queue with
//! [`DeliveryOutcome::Error`]. A poller task long-polls the queue and feeds a
//! bounded channel; the processing loop applies messages one at a time and
//! deletes each only after it was applied, so a failure leaves the message
//! for redelivery and eventually for the dead-letter queue. On the
//! dead-letter queue a message that can never apply is dropped instead.

use std::sync::Arc;

use metrics::counter;
use parley_core::events::{Event, EventKind, SummaryReplyPayload, WorkerReplyPayload};
use parley_store::{QueueConsumer, QueueMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::errors::BridgeError;
use crate::manager::{ConnectionManager, DeliveryOutcome};
use crate::metrics::{QUEUE_MESSAGES_DISCARDED_TOTAL, QUEUE_MESSAGES_FAILED_TOTAL, QUEUE_MESSAGES_PROCESSED_TOTAL};

/// Pulls results off one queue and applies them through the manager.
#[derive(Clone)]
pub struct QueueBridge {
    consumer: Arc<dyn QueueConsumer>,
    manager: Arc<ConnectionManager>,
    outcome: DeliveryOutcome,
    config: BridgeConfig,
}

impl QueueBridge {
    /// Bridge `consumer` into `manager`, tagging replies with `outcome`.
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        manager: Arc<ConnectionManager>,
        outcome: DeliveryOutcome,
        config: BridgeConfig,
    ) -> Self {
        Self {
            consumer,
            manager,
            outcome,
            config,
        }
    }

    /// Run until `cancel` fires. A message being applied is finished first.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(self.config.batch_size.max(1));
            let poller = tokio::spawn(poll(
                Arc::clone(&self.consumer),
                self.config.clone(),
                tx,
                cancel.clone(),
            ));
            info!(queue = self.consumer.name(), outcome = ?self.outcome, "queue bridge started");

            while let Some(message) = rx.recv().await {
                if let Err(error) = self.process(&message).await {
                    warn!(
                        queue = self.consumer.name(),
                        message_id = message.id,
                        receive_count = message.receive_count,
                        %error,
                        "queue message left for redelivery"
                    );
                }
            }
            let _ = poller.await;
            info!(queue = self.consumer.name(), "queue bridge stopped");
        })
    }

    /// Apply one message and acknowledge it.
    ///
    /// The message is deleted only when it was applied; on any error it stays
    /// in the queue. The dead-letter bridge has nowhere further to send a
    /// message that fails permanently, so it deletes it and logs the body.
    pub async fn process(&self, message: &QueueMessage) -> Result<(), BridgeError> {
        let queue = self.consumer.name().to_owned();
        match self.apply(message).await {
            Ok(kind) => {
                self.consumer.delete(&message.receipt).await?;
                counter!(QUEUE_MESSAGES_PROCESSED_TOTAL, "queue" => queue).increment(1);
                debug!(message_id = message.id, event_type = %kind, "queue message applied");
                Ok(())
            }
            Err(cause) if self.outcome == DeliveryOutcome::Error && cause.is_permanent() => {
                self.consumer.delete(&message.receipt).await?;
                counter!(QUEUE_MESSAGES_DISCARDED_TOTAL, "queue" => queue).increment(1);
                error!(
                    message_id = message.id,
                    receive_count = message.receive_count,
                    body = %message.body,
                    error = %cause,
                    "dead-lettered message discarded"
                );
                Ok(())
            }
            Err(error) => {
                counter!(QUEUE_MESSAGES_FAILED_TOTAL, "queue" => queue).increment(1);
                Err(error)
            }
        }
    }

    async fn apply(&self, message: &QueueMessage) -> Result<EventKind, BridgeError> {
        let event = Event::from_json(&message.body)?;
        match event.kind() {
            Some(EventKind::NewMessageFromPrompt) => {
                let reply: WorkerReplyPayload = event.decode_payload()?;
                self.manager.deliver_worker_reply(reply, self.outcome).await?;
                Ok(EventKind::NewMessageFromPrompt)
            }
            Some(EventKind::NewSummaryRequest) => {
                let reply: SummaryReplyPayload = event.decode_payload()?;
                self.manager.deliver_summary(reply).await?;
                Ok(EventKind::NewSummaryRequest)
            }
            _ => Err(BridgeError::Unexpected(event.event_type)),
        }
    }
}

async fn poll(
    consumer: Arc<dyn QueueConsumer>,
    config: BridgeConfig,
    tx: mpsc::Sender<QueueMessage>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => return,
            batch = consumer.receive(config.batch_size, config.wait) => batch,
        };
        match batch {
            Ok(messages) => {
                for message in messages {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
            Err(error) => {
                warn!(queue = consumer.name(), %error, "queue receive failed");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }
}
