//! Collaborators the sync engine consumes: session, clock, deletion cleanup.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::SourceSyncKey;

/// Supplies the signed-in user that scopes both stores
pub trait SessionProvider: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

/// Session whose user can be switched at runtime
#[derive(Debug, Default)]
pub struct SessionHandle {
    user: RwLock<Option<String>>,
}

impl SessionHandle {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user: RwLock::new(user_id),
        }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self::new(Some(user_id.into()))
    }

    pub fn set_user(&self, user_id: Option<String>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user_id;
    }
}

impl SessionProvider for SessionHandle {
    fn user_id(&self) -> Option<String> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Source of `updated_at` stamps for local writes (Unix ms)
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub const fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Invoked after documents were removed from the local replica, e.g. to drop
/// attachments or reminders that referenced them.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn on_deleted(&self, source: &SourceSyncKey, document_ids: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_handle_switches_user() {
        let session = SessionHandle::signed_in("user-1");
        assert_eq!(session.user_id().as_deref(), Some("user-1"));
        session.set_user(None);
        assert_eq!(session.user_id(), None);
    }

    #[test]
    fn manual_clock_moves_on_request() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
