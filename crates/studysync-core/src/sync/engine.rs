//! Background scheduling: one drain task and one realtime task per source.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::backoff::RetryPolicy;
use super::cancel::{CancelHandle, CancelSignal};
use super::coordinator::SyncCoordinator;
use super::ingestor::RealtimeIngestor;
use super::registry::SyncRegistry;
use crate::config::EngineConfig;
use crate::state::{StatusBoard, SyncState};

/// Last known connectivity; pends forever once the signal's sender is gone.
struct Connectivity {
    rx: Option<watch::Receiver<bool>>,
    online: bool,
}

impl Connectivity {
    fn new(mut rx: watch::Receiver<bool>) -> Self {
        let online = *rx.borrow_and_update();
        Self {
            rx: Some(rx),
            online,
        }
    }

    const fn online(&self) -> bool {
        self.online
    }

    /// Wait for the next change and return the new value
    async fn changed(&mut self) -> bool {
        if let Some(rx) = &mut self.rx {
            if rx.changed().await.is_ok() {
                self.online = *rx.borrow_and_update();
                return self.online;
            }
            self.rx = None;
        }
        std::future::pending::<bool>().await
    }

    async fn until_offline(&mut self) {
        while self.changed().await {}
    }

    async fn until_online(&mut self) {
        while !self.online {
            self.changed().await;
        }
    }
}

/// Running engine. Dropping it without `shutdown` leaves the tasks running
/// until the runtime stops.
pub struct SyncEngine {
    registry: Arc<SyncRegistry>,
    board: Arc<StatusBoard>,
    cancel: CancelHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncEngine {
    /// Spawn the per-source tasks on the current runtime.
    ///
    /// Drains run on the periodic timer, on `request_sync`, and when
    /// connectivity returns. With `realtime`, each source also keeps a live
    /// subscription while online.
    pub fn start(
        registry: Arc<SyncRegistry>,
        config: &EngineConfig,
        connectivity: watch::Receiver<bool>,
        realtime: bool,
    ) -> Self {
        let initial = if *connectivity.borrow() {
            SyncState::Syncing
        } else {
            SyncState::Offline
        };
        let board = Arc::new(StatusBoard::new(
            registry.sources().map(|(source, _)| source.clone()),
            initial,
        ));
        let cancel = CancelHandle::new();
        let interval = config.sync_interval().max(Duration::from_secs(1));

        let mut tasks = Vec::new();
        for coordinator in registry.coordinators() {
            tasks.push(tokio::spawn(drain_loop(
                Arc::clone(coordinator),
                Arc::clone(&board),
                cancel.clone(),
                Connectivity::new(connectivity.clone()),
                interval,
                config.retry,
            )));
            if realtime {
                tasks.push(tokio::spawn(realtime_loop(
                    Arc::clone(coordinator),
                    Arc::clone(&board),
                    cancel.clone(),
                    Connectivity::new(connectivity.clone()),
                    config.retry,
                )));
            }
        }
        tracing::info!(sources = board.snapshot().len(), realtime, "sync engine started");

        Self {
            registry,
            board,
            cancel,
            tasks,
        }
    }

    pub const fn registry(&self) -> &Arc<SyncRegistry> {
        &self.registry
    }

    /// Aggregate state across sources
    pub fn status(&self) -> watch::Receiver<SyncState> {
        self.board.subscribe()
    }

    pub const fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    /// Trigger a cycle on every source
    pub fn sync_now(&self) {
        for coordinator in self.registry.coordinators() {
            coordinator.request_sync();
        }
    }

    /// Resolves when the engine stops, on `shutdown` or after a local storage failure
    pub async fn stopped(&self) {
        self.cancel.signal().cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every task and wait for them to finish their current step
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(error) = task.await {
                if error.is_panic() {
                    tracing::error!("sync task panicked: {error}");
                }
            }
        }
        tracing::info!("sync engine stopped");
    }
}

async fn drain_loop(
    coordinator: Arc<SyncCoordinator>,
    board: Arc<StatusBoard>,
    cancel_handle: CancelHandle,
    mut connectivity: Connectivity,
    interval: Duration,
    retry: RetryPolicy,
) {
    let source = coordinator.source().clone();
    let mut cancel = cancel_handle.signal();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = coordinator.sync_requested() => {}
            online = connectivity.changed() => {
                if !online {
                    board.set(&source, SyncState::Offline);
                    continue;
                }
            }
        }

        if !connectivity.online() {
            board.set(&source, SyncState::Offline);
            continue;
        }

        board.set(&source, SyncState::Syncing);
        let failed = match coordinator.sync(&cancel).await {
            Ok(report) if report.coalesced || report.cancelled => false,
            Ok(report) if report.retry_needed => true,
            Ok(report) => {
                failures = 0;
                let state = if report.blocked {
                    SyncState::Error
                } else {
                    SyncState::Synced
                };
                board.set(&source, state);
                false
            }
            Err(error) if error.is_local_storage() => {
                tracing::error!(source = %source, "stopping sync engine: {error}");
                board.set(&source, SyncState::Error);
                cancel_handle.cancel();
                break;
            }
            Err(error) => {
                tracing::warn!(source = %source, "sync cycle failed: {error}");
                true
            }
        };

        if !failed {
            continue;
        }
        failures += 1;
        if retry.exhausted(failures) {
            tracing::error!(source = %source, failures, "retries exhausted, waiting for the next trigger");
            board.set(&source, SyncState::Error);
            failures = 0;
            continue;
        }
        board.set(&source, SyncState::Offline);
        let delay = retry.delay_for(failures);
        tracing::debug!(source = %source, failures, ?delay, "retrying sync");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => coordinator.request_sync(),
            () = connectivity.until_offline() => board.set(&source, SyncState::Offline),
        }
    }
}

async fn realtime_loop(
    coordinator: Arc<SyncCoordinator>,
    board: Arc<StatusBoard>,
    cancel_handle: CancelHandle,
    mut connectivity: Connectivity,
    retry: RetryPolicy,
) {
    let source = coordinator.source().clone();
    let mut cancel: CancelSignal = cancel_handle.signal();
    let ingestor = RealtimeIngestor::new(Arc::clone(&coordinator), retry);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = connectivity.until_online() => {}
        }

        let outcome = tokio::select! {
            outcome = ingestor.run(cancel.clone()) => outcome,
            () = connectivity.until_offline() => {
                tracing::debug!(source = %source, "offline, realtime feed paused");
                continue;
            }
        };

        match outcome {
            Ok(()) => return,
            Err(error) if error.is_local_storage() => {
                tracing::error!(source = %source, "stopping sync engine: {error}");
                board.set(&source, SyncState::Error);
                cancel_handle.cancel();
                return;
            }
            Err(error) => {
                tracing::warn!(source = %source, "realtime feed stopped until connectivity changes: {error}");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = connectivity.changed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connectivity_tracks_signal() {
        let (tx, rx) = watch::channel(false);
        let mut connectivity = Connectivity::new(rx);
        assert!(!connectivity.online());

        tx.send_replace(true);
        assert!(connectivity.changed().await);
        assert!(connectivity.online());

        drop(tx);
        let pending =
            tokio::time::timeout(Duration::from_millis(20), connectivity.changed()).await;
        assert!(pending.is_err());
        assert!(connectivity.online());
    }
}
