//! Push-notification gateway collaborator.
//!
//! Delivers notifications when the application is not foregrounded. A client
//! registers once per identity and platform and receives an opaque token;
//! the in-memory gateway mints random tokens and loops deliveries straight
//! back to per-user subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use causette_shared::constants::{BROADCAST_BUFFER, SUBSCRIPTION_BUFFER};
use causette_shared::{ConversationId, Subscription, TaskGuard, UserId};

use crate::error::{NetError, Result};

/// Delivery surface for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Web,
    WebView,
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::WebView => "webview",
        }
    }
}

/// Opaque registration token minted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushToken(pub String);

/// A background notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub conversation: ConversationId,
    pub sender: UserId,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Register this identity on a platform. Re-registration replaces the
    /// previous token for that platform.
    async fn register(&self, user: UserId, platform: Platform) -> Result<PushToken>;

    /// Deliver a message to every registered platform of the target user.
    async fn send(&self, to: UserId, message: PushMessage) -> Result<()>;

    /// Stream of messages delivered to this user.
    fn incoming(&self, user: UserId) -> Subscription<PushMessage>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryPushGateway {
    tokens: Arc<Mutex<HashMap<(UserId, Platform), PushToken>>>,
    deliveries: broadcast::Sender<(UserId, PushMessage)>,
}

impl MemoryPushGateway {
    pub fn new() -> Self {
        let (deliveries, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
            deliveries,
        }
    }

    /// Current token for a registration, for assertions and diagnostics.
    pub fn token(&self, user: UserId, platform: Platform) -> Result<Option<PushToken>> {
        let tokens = self.tokens.lock().map_err(|_| NetError::LockPoisoned)?;
        Ok(tokens.get(&(user, platform)).cloned())
    }
}

impl Default for MemoryPushGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushGateway for MemoryPushGateway {
    async fn register(&self, user: UserId, platform: Platform) -> Result<PushToken> {
        let token = PushToken(hex::encode(rand::random::<[u8; 32]>()));
        {
            let mut tokens = self.tokens.lock().map_err(|_| NetError::LockPoisoned)?;
            tokens.insert((user, platform), token.clone());
        }
        info!(user = %user, platform = platform.name(), "Push registration stored");
        Ok(token)
    }

    async fn send(&self, to: UserId, message: PushMessage) -> Result<()> {
        let registered = {
            let tokens = self.tokens.lock().map_err(|_| NetError::LockPoisoned)?;
            tokens.keys().any(|(user, _)| *user == to)
        };
        if !registered {
            return Err(NetError::NotRegistered);
        }
        debug!(to = %to, conversation = %message.conversation, "Push delivery");
        let _ = self.deliveries.send((to, message));
        Ok(())
    }

    fn incoming(&self, user: UserId) -> Subscription<PushMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut deliveries = self.deliveries.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match deliveries.recv().await {
                    Ok((to, message)) if to == user => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Push subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(rx, TaskGuard::new(handle))
    }
}
