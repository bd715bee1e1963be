use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use echocache::Sweeper;
use parking_lot::RwLock;

/// Revoked tokens, each remembered until it would have expired anyway.
#[derive(Debug, Clone, Default)]
pub struct RevocationList {
    entries: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl RevocationList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke `token` until `expires`.
    pub fn insert(&self, token: impl Into<String>, expires: DateTime<Utc>) {
        self.entries.write().insert(token.into(), expires);
    }

    /// Whether `token` has been revoked.
    pub fn contains(&self, token: &str) -> bool {
        self.entries.read().contains_key(token)
    }

    /// Number of revoked tokens held.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no tokens are held.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop revocations for tokens whose expiry is before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires| *expires > now);
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = entries.len(), "Purged expired revocations");
        }
        purged
    }

    /// Spawn a task which purges expired revocations every `period`.
    pub fn sweep_every(&self, period: Duration) -> Sweeper {
        let entries: Weak<_> = Arc::downgrade(&self.entries);
        Sweeper::every(period, move || match entries.upgrade() {
            Some(entries) => {
                RevocationList { entries }.purge_expired(Utc::now());
                true
            }
            None => false,
        })
    }
}
