//! Sync status shared with front ends.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::models::SourceSyncKey;

/// Sync state of one source, or of the engine as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    const fn severity(self) -> u8 {
        match self {
            Self::Synced => 0,
            Self::Offline => 1,
            Self::Syncing => 2,
            Self::Error => 3,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        })
    }
}

/// Per-source states plus an aggregate published on a watch channel.
///
/// The aggregate is the most severe source state: error, then syncing, then
/// offline, then synced.
pub struct StatusBoard {
    states: Mutex<BTreeMap<SourceSyncKey, SyncState>>,
    aggregate: watch::Sender<SyncState>,
}

impl StatusBoard {
    pub fn new(sources: impl IntoIterator<Item = SourceSyncKey>, initial: SyncState) -> Self {
        let states: BTreeMap<_, _> = sources.into_iter().map(|source| (source, initial)).collect();
        let (aggregate, _) = watch::channel(Self::fold(&states));
        Self {
            states: Mutex::new(states),
            aggregate,
        }
    }

    fn states(&self) -> MutexGuard<'_, BTreeMap<SourceSyncKey, SyncState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fold(states: &BTreeMap<SourceSyncKey, SyncState>) -> SyncState {
        states
            .values()
            .copied()
            .max_by_key(|state| state.severity())
            .unwrap_or(SyncState::Synced)
    }

    pub fn set(&self, source: &SourceSyncKey, state: SyncState) {
        let aggregate = {
            let mut states = self.states();
            states.insert(source.clone(), state);
            Self::fold(&states)
        };
        self.aggregate.send_if_modified(|current| {
            let changed = *current != aggregate;
            *current = aggregate;
            changed
        });
    }

    pub fn get(&self, source: &SourceSyncKey) -> Option<SyncState> {
        self.states().get(source).copied()
    }

    pub fn snapshot(&self) -> Vec<(SourceSyncKey, SyncState)> {
        self.states()
            .iter()
            .map(|(source, state)| (source.clone(), *state))
            .collect()
    }

    pub fn aggregate(&self) -> SyncState {
        *self.aggregate.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.aggregate.subscribe()
    }
}
