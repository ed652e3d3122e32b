//! Realtime subscription loop for one source

use std::sync::Arc;

use super::backoff::RetryPolicy;
use super::cancel::CancelSignal;
use super::coordinator::{EventOutcome, SyncCoordinator};
use crate::error::{Error, Result};

/// Feeds realtime events into a coordinator and keeps the subscription alive.
///
/// Every (re)subscription requests a sync so events missed while the feed was
/// down are picked up by the diff.
pub struct RealtimeIngestor {
    coordinator: Arc<SyncCoordinator>,
    retry: RetryPolicy,
}

impl RealtimeIngestor {
    pub const fn new(coordinator: Arc<SyncCoordinator>, retry: RetryPolicy) -> Self {
        Self { coordinator, retry }
    }

    /// Run until cancelled.
    ///
    /// Returns `Err` when the local replica fails or when subscribing keeps
    /// failing past the retry budget.
    pub async fn run(&self, mut cancel: CancelSignal) -> Result<()> {
        let source = self.coordinator.source().clone();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let subscribed = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                subscribed = self.coordinator.subscribe() => subscribed,
            };

            match subscribed {
                Ok(mut subscription) => {
                    attempt = 0;
                    tracing::info!(source = %source, "realtime subscription open");
                    self.coordinator.request_sync();

                    loop {
                        let event = tokio::select! {
                            () = cancel.cancelled() => return Ok(()),
                            event = subscription.next() => event,
                        };
                        let Some(event) = event else {
                            break;
                        };
                        match self.coordinator.apply_event(&event).await {
                            Ok(EventOutcome::Applied) => {
                                tracing::debug!(source = %source, document = %event.document_id, "applied realtime event");
                            }
                            Ok(_) => {}
                            Err(error) if error.is_local_storage() => {
                                tracing::error!(source = %source, "local storage failed applying realtime event: {error}");
                                return Err(error);
                            }
                            Err(error) => {
                                tracing::warn!(source = %source, document = %event.document_id, "realtime event not applied: {error}");
                            }
                        }
                    }
                    tracing::warn!(source = %source, "realtime subscription lost");
                }
                Err(error) if error.is_local_storage() => return Err(error),
                Err(Error::Permission(message)) => {
                    tracing::warn!(source = %source, "realtime subscription refused: {message}");
                    return Err(Error::Permission(message));
                }
                Err(error) => {
                    tracing::warn!(source = %source, "realtime subscribe failed: {error}");
                }
            }

            attempt += 1;
            if self.retry.exhausted(attempt) {
                return Err(Error::WebSocket(format!(
                    "realtime feed for '{source}' gave up after {attempt} attempts"
                )));
            }
            let delay = self.retry.delay_for(attempt);
            tracing::debug!(source = %source, attempt, ?delay, "reconnecting realtime feed");
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
