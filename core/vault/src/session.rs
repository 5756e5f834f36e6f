//! Password session and lock status.
//!
//! A session caches the snapshot key together with an optional deadline.
//! Once the deadline passes the key is zeroized and the snapshot is locked
//! until it is reloaded with the password.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use bastion_common::{Error, Result};
use bastion_crypto::SnapshotKey;

/// Lock status of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Status {
    /// The key is cleared; only `reload` restores access.
    Locked,
    /// The key is cached. `remaining` is the time until it is cleared, or
    /// `None` when no clear is scheduled.
    Unlocked { remaining: Option<Duration> },
}

impl Status {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Notification sent to status listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub snapshot_path: PathBuf,
    pub status: Status,
}

/// Handle for removing a status listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(Uuid);

type Listener = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// Listeners registered on one snapshot.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: Mutex<Vec<(ListenerToken, Listener)>>,
}

impl Listeners {
    pub fn subscribe(&self, listener: Listener) -> ListenerToken {
        let token = ListenerToken(Uuid::new_v4());
        match self.entries.lock() {
            Ok(mut entries) => entries.push((token, listener)),
            Err(poisoned) => poisoned.into_inner().push((token, listener)),
        }
        token
    }

    pub fn unsubscribe(&self, token: ListenerToken) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    /// Call every listener. Listeners run outside the registry lock so they
    /// may subscribe or unsubscribe.
    pub fn notify(&self, event: &StatusEvent) {
        let listeners: Vec<Listener> = match self.entries.lock() {
            Ok(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            Err(poisoned) => {
                warn!("Status listener registry poisoned");
                poisoned.into_inner().iter().map(|(_, l)| l.clone()).collect()
            }
        };
        for listener in listeners {
            listener(event);
        }
    }
}

/// Cached key with its clear deadline.
pub(crate) struct PasswordSession {
    key: Option<SnapshotKey>,
    interval: Option<Duration>,
    deadline: Option<Instant>,
}

impl PasswordSession {
    /// Start an unlocked session. A zero interval locks at once.
    pub fn new(key: SnapshotKey, interval: Option<Duration>) -> Self {
        let mut session = Self {
            key: Some(key),
            interval: None,
            deadline: None,
        };
        if let Some(interval) = interval {
            session.set_interval(interval);
        }
        session
    }

    /// Cached key, unless locked or past the deadline.
    ///
    /// # Errors
    /// - `Locked`
    pub fn key(&self) -> Result<&SnapshotKey> {
        if self.is_expired() {
            return Err(Error::Locked);
        }
        self.key.as_ref().ok_or(Error::Locked)
    }

    /// Fail with `Locked` unless the key is usable.
    pub fn ensure_unlocked(&self) -> Result<()> {
        self.key().map(|_| ())
    }

    pub fn is_locked(&self) -> bool {
        self.key.is_none()
    }

    /// Key still cached but the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.key.is_some() && self.deadline.is_some_and(|d| d <= Instant::now())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.filter(|_| self.key.is_some())
    }

    pub fn status(&self) -> Status {
        if self.key.is_none() || self.is_expired() {
            return Status::Locked;
        }
        Status::Unlocked {
            remaining: self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now())),
        }
    }

    /// Schedule the key to be cleared `interval` from now.
    ///
    /// Returns `true` if this locked the session.
    pub fn set_interval(&mut self, interval: Duration) -> bool {
        self.interval = Some(interval);
        if interval.is_zero() {
            return self.lock();
        }
        if self.key.is_some() {
            self.deadline = Some(Instant::now() + interval);
        }
        false
    }

    /// Keep the key until unload or an explicit lock.
    pub fn disable_clear(&mut self) {
        self.interval = None;
        self.deadline = None;
    }

    /// Clear the key if the deadline has passed. Returns `true` if this
    /// locked the session.
    pub fn expire_if_due(&mut self) -> bool {
        self.is_expired() && self.lock()
    }

    /// Zeroize the key. Returns `true` if the session was unlocked.
    pub fn lock(&mut self) -> bool {
        self.deadline = None;
        // SnapshotKey zeroizes on drop
        self.key.take().is_some()
    }

    /// Swap the cached key, keeping the deadline.
    pub fn rekey(&mut self, key: SnapshotKey) {
        self.key = Some(key);
    }

    /// Cache `key` again and restart the interval. Returns `true` if the
    /// session was locked.
    pub fn unlock(&mut self, key: SnapshotKey) -> bool {
        let was_locked = self.key.is_none() || self.is_expired();
        self.key = Some(key);
        self.deadline = match self.interval {
            Some(interval) if !interval.is_zero() => Some(Instant::now() + interval),
            _ => None,
        };
        was_locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> SnapshotKey {
        SnapshotKey::from_bytes([9u8; 32])
    }

    #[test]
    fn test_no_interval_stays_unlocked() {
        let session = PasswordSession::new(key(), None);
        assert_eq!(session.status(), Status::Unlocked { remaining: None });
        assert!(session.key().is_ok());
    }

    #[test]
    fn test_zero_interval_locks_immediately() {
        let mut session = PasswordSession::new(key(), None);
        assert!(session.set_interval(Duration::ZERO));

        assert_eq!(session.status(), Status::Locked);
        assert!(matches!(session.key(), Err(Error::Locked)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let mut session = PasswordSession::new(key(), Some(Duration::from_secs(10)));
        assert!(matches!(
            session.status(),
            Status::Unlocked { remaining: Some(r) } if r <= Duration::from_secs(10)
        ));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(session.status(), Status::Locked);
        assert!(session.expire_if_due());
        assert!(session.is_locked());
        assert!(!session.expire_if_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_restarts_interval() {
        let mut session = PasswordSession::new(key(), Some(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(6)).await;
        session.expire_if_due();

        assert!(session.unlock(key()));
        assert!(!session.is_locked());
        assert!(session.deadline().is_some());
    }

    #[test]
    fn test_disable_clear() {
        let mut session = PasswordSession::new(key(), Some(Duration::from_secs(5)));
        session.disable_clear();
        assert_eq!(session.status(), Status::Unlocked { remaining: None });
    }

    #[test]
    fn test_listeners_subscribe_unsubscribe() {
        let listeners = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = listeners.subscribe(Arc::new(move |_: &StatusEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let event = StatusEvent {
            snapshot_path: PathBuf::from("s"),
            status: Status::Locked,
        };

        listeners.notify(&event);
        assert!(listeners.unsubscribe(token));
        assert!(!listeners.unsubscribe(token));
        listeners.notify(&event);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(Status::Unlocked {
            remaining: Some(Duration::from_secs(3)),
        })
        .unwrap();
        assert_eq!(json["type"], "Unlocked");
        assert_eq!(json["payload"]["remaining"]["secs"], 3);
    }
}
