//! Client entry point: owns the collaborator set and swaps the live session
//! as the identity provider reports sign-ins and sign-outs.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::error;

use causette_net::{
    MemoryPresence, MemoryPushGateway, MemoryRelay, PresenceStore, PushGateway, Relay,
};
use causette_shared::TaskGuard;
use causette_store::{ConversationStore, MemoryStore};

use crate::config::ClientConfig;
use crate::notify::{LogSink, NoWindows, NotificationSink, WindowBridge};
use crate::session::{AuthEvent, IdentityProvider, Session, SessionContext};

/// The collaborator set a client runs against, injected at construction.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ConversationStore>,
    pub relay: Arc<dyn Relay>,
    pub presence: Arc<dyn PresenceStore>,
    pub push: Arc<dyn PushGateway>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn NotificationSink>,
    pub windows: Arc<dyn WindowBridge>,
}

impl Backends {
    /// Fully in-memory wiring for tests and the demo.  Returns the identity
    /// handle separately so callers can drive sign-in and sign-out.
    pub fn in_memory() -> (Self, Arc<crate::session::MemoryIdentity>) {
        let identity = Arc::new(crate::session::MemoryIdentity::new());
        let backends = Self {
            store: Arc::new(MemoryStore::new()),
            relay: Arc::new(MemoryRelay::new()),
            presence: Arc::new(MemoryPresence::new()),
            push: Arc::new(MemoryPushGateway::new()),
            identity: identity.clone(),
            notifier: Arc::new(LogSink),
            windows: Arc::new(NoWindows),
        };
        (backends, identity)
    }
}

/// Watches the identity provider and keeps exactly one [`Session`] alive for
/// the signed-in user.
pub struct ChatClient {
    backends: Backends,
    config: ClientConfig,
    session: Arc<Mutex<Option<Arc<Session>>>>,
    watcher: TaskGuard,
}

impl ChatClient {
    /// Start the engine.  A session comes up once the provider reports a
    /// signed-in identity and is torn down again on sign-out; a session
    /// start failure is logged and waits for the next transition.
    pub fn start(backends: Backends, config: ClientConfig) -> Self {
        let session: Arc<Mutex<Option<Arc<Session>>>> = Arc::new(Mutex::new(None));
        let slot = session.clone();
        let shared = backends.clone();
        let session_config = config.clone();
        let watcher = tokio::spawn(async move {
            let mut events = shared.identity.watch();
            while let Some(event) = events.recv().await {
                match event {
                    AuthEvent::SignedIn(user) => {
                        let duplicate = slot
                            .lock()
                            .await
                            .as_ref()
                            .map(|session| session.user().id == user.id)
                            .unwrap_or(false);
                        if duplicate {
                            continue;
                        }
                        // A different identity signed in; retire the old
                        // session before starting the new one.
                        if let Some(previous) = slot.lock().await.take() {
                            previous.shutdown().await;
                        }
                        let ctx = SessionContext {
                            user: user.clone(),
                            store: shared.store.clone(),
                            relay: shared.relay.clone(),
                            presence: shared.presence.clone(),
                            push: shared.push.clone(),
                            config: session_config.clone(),
                        };
                        match Session::start(ctx, shared.notifier.clone(), shared.windows.clone())
                            .await
                        {
                            Ok(started) => {
                                *slot.lock().await = Some(Arc::new(started));
                            }
                            Err(err) => {
                                error!(user = %user.id, error = %err, "Session start failed");
                            }
                        }
                    }
                    AuthEvent::SignedOut => {
                        if let Some(previous) = slot.lock().await.take() {
                            previous.shutdown().await;
                        }
                    }
                }
            }
        });
        Self {
            backends,
            config,
            session,
            watcher: TaskGuard::new(watcher),
        }
    }

    /// The live session, if an identity is signed in.
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().await.clone()
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stop watching the identity provider and tear down the active session.
    pub async fn shutdown(&self) {
        self.watcher.abort();
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use causette_shared::{UserId, UserSummary};

    fn user(name: &str) -> UserSummary {
        UserSummary {
            id: UserId::new(),
            display_name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            photo_url: None,
        }
    }

    async fn wait_for_session(client: &ChatClient) -> Arc<Session> {
        for _ in 0..200 {
            if let Some(session) = client.session().await {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never started");
    }

    async fn wait_for_no_session(client: &ChatClient) {
        for _ in 0..200 {
            if client.session().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_brings_session_up_and_sign_out_tears_down() {
        let (backends, identity) = Backends::in_memory();
        let client = ChatClient::start(backends, ClientConfig::default());

        let ada = user("Ada");
        identity.sign_in(ada.clone());
        let session = wait_for_session(&client).await;
        assert_eq!(session.user().id, ada.id);

        identity.sign_out();
        wait_for_no_session(&client).await;
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sign_in_keeps_the_session() {
        let (backends, identity) = Backends::in_memory();
        let client = ChatClient::start(backends, ClientConfig::default());

        let ada = user("Ada");
        identity.sign_in(ada.clone());
        let first = wait_for_session(&client).await;

        identity.sign_in(ada);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = wait_for_session(&client).await;
        assert!(Arc::ptr_eq(&first, &second));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_switch_replaces_session() {
        let (backends, identity) = Backends::in_memory();
        let client = ChatClient::start(backends, ClientConfig::default());

        identity.sign_in(user("Ada"));
        let first = wait_for_session(&client).await;

        let grace = user("Grace");
        identity.sign_in(grace.clone());
        for _ in 0..200 {
            if let Some(session) = client.session().await {
                if session.user().id == grace.id {
                    assert!(!Arc::ptr_eq(&first, &session));
                    client.shutdown().await;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never switched identities");
    }
}
