//! Realtime presence collaborator.
//!
//! A [`PresenceSession`] is handed out per connection. The session owns an
//! "on disconnect" record registered up front; the backend applies it when
//! the connection ends, including abnormal termination. The in-memory
//! implementation mirrors that by applying the armed record on `Drop`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use causette_shared::constants::{BROADCAST_BUFFER, SUBSCRIPTION_BUFFER};
use causette_shared::{PresenceRecord, Subscription, TaskGuard, UserId};

use crate::error::{NetError, Result};

/// Key-value presence store with disconnect-triggered writes.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Open a connection-scoped session for this user.
    async fn connect(&self, user: UserId) -> Result<Box<dyn PresenceSession>>;

    async fn get(&self, user: UserId) -> Result<Option<PresenceRecord>>;

    /// The user's current record, then a fresh one on every change. A user
    /// never seen reads as offline.
    fn watch(&self, user: UserId) -> Subscription<PresenceRecord>;
}

/// One live connection to the presence store.
#[async_trait]
pub trait PresenceSession: Send + Sync {
    /// Write the user's record now.
    async fn set(&self, record: PresenceRecord) -> Result<()>;

    /// Register the record the backend applies when this session ends, even
    /// if the client terminates abnormally.
    async fn on_disconnect(&self, record: PresenceRecord) -> Result<()>;

    /// End the session, applying the registered disconnect record.
    async fn disconnect(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryPresence {
    records: Arc<Mutex<HashMap<UserId, PresenceRecord>>>,
    changes: broadcast::Sender<UserId>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            changes,
        }
    }

    fn write(&self, user: UserId, record: PresenceRecord) -> Result<()> {
        let changed = {
            let mut records = self.records.lock().map_err(|_| NetError::LockPoisoned)?;
            let changed = records.get(&user) != Some(&record);
            if changed {
                records.insert(user, record);
            }
            changed
        };
        if changed {
            let _ = self.changes.send(user);
        }
        Ok(())
    }

    fn current(&self, user: UserId) -> PresenceRecord {
        match self.records.lock() {
            Ok(records) => records.get(&user).cloned().unwrap_or_default(),
            Err(_) => {
                warn!(user = %user, "Presence lock poisoned, reporting offline");
                PresenceRecord::default()
            }
        }
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn connect(&self, user: UserId) -> Result<Box<dyn PresenceSession>> {
        debug!(user = %user, "Presence session opened");
        Ok(Box::new(MemorySession {
            user,
            store: self.clone(),
            armed: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    async fn get(&self, user: UserId) -> Result<Option<PresenceRecord>> {
        let records = self.records.lock().map_err(|_| NetError::LockPoisoned)?;
        Ok(records.get(&user).cloned())
    }

    fn watch(&self, user: UserId) -> Subscription<PresenceRecord> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let store = self.clone();
        let mut changes = self.changes.subscribe();

        let handle = tokio::spawn(async move {
            if tx.send(store.current(user)).await.is_err() {
                return;
            }
            loop {
                let relevant = match changes.recv().await {
                    Ok(changed) => changed == user,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Presence watcher lagged, resyncing");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if relevant && tx.send(store.current(user)).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(rx, TaskGuard::new(handle))
    }
}

struct MemorySession {
    user: UserId,
    store: MemoryPresence,
    /// Record to apply when the session ends.
    armed: Mutex<Option<PresenceRecord>>,
    closed: AtomicBool,
}

impl MemorySession {
    /// Apply the armed disconnect record exactly once.
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let armed = self
            .armed
            .lock()
            .map_err(|_| NetError::LockPoisoned)?
            .take();
        if let Some(record) = armed {
            self.store.write(self.user, record)?;
        }
        debug!(user = %self.user, "Presence session closed");
        Ok(())
    }
}

#[async_trait]
impl PresenceSession for MemorySession {
    async fn set(&self, record: PresenceRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Disconnected);
        }
        self.store.write(self.user, record)
    }

    async fn on_disconnect(&self, record: PresenceRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Disconnected);
        }
        *self.armed.lock().map_err(|_| NetError::LockPoisoned)? = Some(record);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.close()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // Abnormal termination still applies the registered record.
        if let Err(error) = self.close() {
            warn!(user = %self.user, %error, "Presence disconnect write failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let presence = MemoryPresence::new();
        let user = UserId::new();
        assert_eq!(presence.get(user).await.unwrap(), None);

        let session = presence.connect(user).await.unwrap();
        let record = PresenceRecord::online(Utc::now());
        session.set(record.clone()).await.unwrap();

        assert_eq!(presence.get(user).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_disconnect_applies_armed_record() {
        let presence = MemoryPresence::new();
        let user = UserId::new();
        let session = presence.connect(user).await.unwrap();

        let offline = PresenceRecord::offline(Utc::now());
        session.on_disconnect(offline.clone()).await.unwrap();
        session.set(PresenceRecord::online(Utc::now())).await.unwrap();
        session.disconnect().await.unwrap();

        assert_eq!(presence.get(user).await.unwrap(), Some(offline));
    }

    #[tokio::test]
    async fn test_drop_applies_armed_record() {
        let presence = MemoryPresence::new();
        let user = UserId::new();

        let offline = PresenceRecord::offline(Utc::now());
        {
            let session = presence.connect(user).await.unwrap();
            session.on_disconnect(offline.clone()).await.unwrap();
            session.set(PresenceRecord::online(Utc::now())).await.unwrap();
            assert!(presence.get(user).await.unwrap().unwrap().online);
            // Dropped without an explicit disconnect.
        }

        assert_eq!(presence.get(user).await.unwrap(), Some(offline));
    }

    #[tokio::test]
    async fn test_set_after_disconnect_is_rejected() {
        let presence = MemoryPresence::new();
        let user = UserId::new();
        let session = presence.connect(user).await.unwrap();
        session.disconnect().await.unwrap();

        let err = session
            .set(PresenceRecord::online(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Disconnected));
    }

    #[tokio::test]
    async fn test_watch_emits_current_then_updates() {
        let presence = MemoryPresence::new();
        let user = UserId::new();

        let mut watcher = presence.watch(user);
        assert_eq!(watcher.recv().await.unwrap(), PresenceRecord::default());

        let session = presence.connect(user).await.unwrap();
        let online = PresenceRecord::online(Utc::now());
        session.set(online.clone()).await.unwrap();

        assert_eq!(watcher.recv().await.unwrap(), online);
    }
}
