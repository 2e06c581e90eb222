//! Session lifecycle for one signed-in identity.
//!
//! The engine is inert until an [`IdentityProvider`] reports a signed-in
//! user.  [`Session::start`] then wires every component against a
//! [`SessionContext`] carrying explicitly injected collaborators; nothing in
//! this crate reaches for a global.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use causette_net::{PresenceStore, PushGateway, Relay};
use causette_shared::constants::{BROADCAST_BUFFER, SUBSCRIPTION_BUFFER};
use causette_shared::{ConversationId, Subscription, TaskGuard, UserSummary};
use causette_store::ConversationStore;

use crate::compose::Composer;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::notify::{NotificationDispatcher, NotificationSink, WindowBridge};
use crate::presence::PresenceTracker;
use crate::sync::{ConversationSynchronizer, OpenConversation};
use crate::typing::TypingCoordinator;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(UserSummary),
    SignedOut,
}

/// Supplies the authenticated identity.
pub trait IdentityProvider: Send + Sync {
    /// The currently signed-in user, if any.
    fn current(&self) -> Option<UserSummary>;

    /// Stream of identity transitions.  Emits the current signed-in state
    /// first so late subscribers converge immediately.
    fn watch(&self) -> Subscription<AuthEvent>;
}

/// In-memory identity provider for tests and the demo binary.
#[derive(Clone)]
pub struct MemoryIdentity {
    current: Arc<Mutex<Option<UserSummary>>>,
    events: broadcast::Sender<AuthEvent>,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            current: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn sign_in(&self, user: UserSummary) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(user.clone());
        }
        let _ = self.events.send(AuthEvent::SignedIn(user));
    }

    pub fn sign_out(&self) {
        let signed_in = match self.current.lock() {
            Ok(mut current) => current.take().is_some(),
            Err(_) => false,
        };
        if signed_in {
            let _ = self.events.send(AuthEvent::SignedOut);
        }
    }
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for MemoryIdentity {
    fn current(&self) -> Option<UserSummary> {
        self.current.lock().ok().and_then(|current| current.clone())
    }

    fn watch(&self) -> Subscription<AuthEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Subscribe before sampling so a transition between the two is seen
        // at least once.
        let mut events = self.events.subscribe();
        let initial = self.current();
        let handle = tokio::spawn(async move {
            if let Some(user) = initial {
                if tx.send(AuthEvent::SignedIn(user)).await.is_err() {
                    return;
                }
            }
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Auth watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(rx, TaskGuard::new(handle))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything a session component needs, passed explicitly.
#[derive(Clone)]
pub struct SessionContext {
    pub user: UserSummary,
    pub store: Arc<dyn ConversationStore>,
    pub relay: Arc<dyn Relay>,
    pub presence: Arc<dyn PresenceStore>,
    pub push: Arc<dyn PushGateway>,
    pub config: ClientConfig,
}

/// Live hub for one signed-in identity.
///
/// Owns the per-session components and tears them down together.  Presence
/// must come up before anything else so the disconnect write is registered
/// even if the rest of startup fails.
pub struct Session {
    ctx: SessionContext,
    presence: PresenceTracker,
    sync: ConversationSynchronizer,
    composer: Composer,
    typing: TypingCoordinator,
    notifications: NotificationDispatcher,
}

impl Session {
    pub async fn start(
        ctx: SessionContext,
        sink: Arc<dyn NotificationSink>,
        windows: Arc<dyn WindowBridge>,
    ) -> Result<Session> {
        let presence = PresenceTracker::start(ctx.clone()).await?;

        // Relay membership and push registration are best-effort; the store
        // keeps working without them.
        if let Err(error) = ctx.relay.join(ctx.user.clone()).await {
            warn!(user = %ctx.user.id, %error, "Relay join failed");
        }
        match ctx.push.register(ctx.user.id, ctx.config.platform).await {
            Ok(_) => info!(user = %ctx.user.id, platform = ctx.config.platform.name(), "Push registration complete"),
            Err(error) => warn!(user = %ctx.user.id, %error, "Push registration failed"),
        }

        let notifications = NotificationDispatcher::new(ctx.clone(), sink, windows);
        notifications.start();

        let session = Session {
            presence,
            sync: ConversationSynchronizer::new(ctx.clone()),
            composer: Composer::new(ctx.clone()),
            typing: TypingCoordinator::new(ctx.clone()),
            notifications,
            ctx,
        };
        info!(user = %session.ctx.user.id, "Session started");
        Ok(session)
    }

    pub fn user(&self) -> &UserSummary {
        &self.ctx.user
    }

    pub fn synchronizer(&self) -> &ConversationSynchronizer {
        &self.sync
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Open a conversation: marks it focused for notification suppression
    /// and starts the synchronizer's detail and message streams.
    pub fn open_conversation(&self, id: ConversationId) -> OpenConversation {
        self.notifications.set_focused(Some(id));
        self.sync.open_conversation(id)
    }

    /// Close the open conversation and stop its streams.
    pub fn close_conversation(&self) {
        self.notifications.set_focused(None);
        self.sync.close_conversation();
    }

    /// Tear down in dependency order: timers first so nothing writes after
    /// the streams stop, presence offline last.
    pub async fn shutdown(&self) {
        self.typing.shutdown();
        self.notifications.stop();
        self.sync.shutdown();
        self.presence.shutdown().await;
        if let Err(error) = self.ctx.relay.leave(self.ctx.user.id).await {
            warn!(user = %self.ctx.user.id, %error, "Relay leave failed");
        }
        info!(user = %self.ctx.user.id, "Session closed");
    }
}
