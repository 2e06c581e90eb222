//! Socket-relay collaborator for low-latency notification fan-out.
//!
//! The relay is a dumb pub/sub channel: clients join with their identity
//! slice, publish [`RelayEvent`]s and receive everyone's frames, including
//! their own (suppression of self-originated events happens at the consumer).
//! The in-memory broker keeps the joined roster and rebroadcasts it on every
//! membership change.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use causette_shared::constants::{BROADCAST_BUFFER, RELAY_CHANNEL, SUBSCRIPTION_BUFFER};
use causette_shared::{RelayEvent, Subscription, TaskGuard, UserId, UserSummary};

use crate::error::{NetError, Result};

#[async_trait]
pub trait Relay: Send + Sync {
    /// Announce this identity on the channel and receive the roster.
    async fn join(&self, user: UserSummary) -> Result<()>;

    async fn leave(&self, user: UserId) -> Result<()>;

    async fn publish(&self, event: RelayEvent) -> Result<()>;

    /// Decoded event stream for the notification channel. Undecodable frames
    /// are skipped with a warning.
    fn subscribe(&self) -> Subscription<RelayEvent>;
}

/// In-memory broker. Frames cross the channel JSON-encoded, exactly as a
/// hosted relay would carry them.
#[derive(Clone)]
pub struct MemoryRelay {
    frames: broadcast::Sender<Bytes>,
    joined: Arc<Mutex<Vec<UserSummary>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            frames,
            joined: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn roster(&self) -> Result<Vec<UserSummary>> {
        Ok(self
            .joined
            .lock()
            .map_err(|_| NetError::LockPoisoned)?
            .clone())
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn join(&self, user: UserSummary) -> Result<()> {
        {
            let mut joined = self.joined.lock().map_err(|_| NetError::LockPoisoned)?;
            joined.retain(|u| u.id != user.id);
            joined.push(user.clone());
        }
        debug!(user = %user.id, channel = RELAY_CHANNEL, "Relay join");
        self.publish(RelayEvent::Join(user)).await?;
        self.publish(RelayEvent::ActiveUsers(self.roster()?)).await
    }

    async fn leave(&self, user: UserId) -> Result<()> {
        {
            let mut joined = self.joined.lock().map_err(|_| NetError::LockPoisoned)?;
            joined.retain(|u| u.id != user);
        }
        debug!(user = %user, channel = RELAY_CHANNEL, "Relay leave");
        self.publish(RelayEvent::ActiveUsers(self.roster()?)).await
    }

    async fn publish(&self, event: RelayEvent) -> Result<()> {
        let frame = event.to_bytes()?;
        debug!(event = event.name(), len = frame.len(), "Relay publish");
        // No receivers is not an error; frames are simply dropped.
        let _ = self.frames.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<RelayEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut frames = self.frames.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => match RelayEvent::from_bytes(&frame) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(%error, "Undecodable relay frame skipped");
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Relay subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(rx, TaskGuard::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use causette_shared::protocol::TypingEvent;
    use causette_shared::ConversationId;

    use super::*;

    fn summary(name: &str) -> UserSummary {
        UserSummary {
            id: UserId::new(),
            display_name: name.to_string(),
            email: format!("{name}@example.org"),
            photo_url: None,
        }
    }

    #[tokio::test]
    async fn test_join_announces_and_broadcasts_roster() {
        let relay = MemoryRelay::new();
        let mut sub = relay.subscribe();

        let ada = summary("ada");
        relay.join(ada.clone()).await.unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::Join(user) => assert_eq!(user.id, ada.id),
            other => panic!("expected join, got {other:?}"),
        }
        match sub.recv().await.unwrap() {
            RelayEvent::ActiveUsers(roster) => {
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].id, ada.id);
            }
            other => panic!("expected roster, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_shrinks_roster() {
        let relay = MemoryRelay::new();
        let ada = summary("ada");
        let bob = summary("bob");
        relay.join(ada.clone()).await.unwrap();
        relay.join(bob.clone()).await.unwrap();

        let mut sub = relay.subscribe();
        relay.leave(ada.id).await.unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::ActiveUsers(roster) => {
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].id, bob.id);
            }
            other => panic!("expected roster, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejoin_replaces_roster_entry() {
        let relay = MemoryRelay::new();
        let mut ada = summary("ada");
        relay.join(ada.clone()).await.unwrap();
        ada.display_name = "Ada L.".to_string();
        relay.join(ada.clone()).await.unwrap();

        let roster = relay.roster().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].display_name, "Ada L.");
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let relay = MemoryRelay::new();
        let mut first = relay.subscribe();
        let mut second = relay.subscribe();

        let event = RelayEvent::Typing(TypingEvent {
            conversation: ConversationId::new(),
            user: UserId::new(),
            is_typing: true,
        });
        relay.publish(event.clone()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }
}
