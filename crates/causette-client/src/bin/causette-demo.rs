//! # causette-demo
//!
//! Two in-memory identities exchanging messages end to end: sign-in,
//! conversation creation, realtime list and message streams, typing,
//! reactions, archiving, and sign-out.  Everything runs in-process against
//! the memory backends; the log output is the demo.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use causette_client::{
    Backends, ChatClient, ClientConfig, DetailState, LogSink, MemoryIdentity, MessageState,
    NoWindows, Session,
};
use causette_net::{MemoryPresence, MemoryPushGateway, MemoryRelay};
use causette_shared::constants::APP_NAME;
use causette_shared::{UserId, UserSummary};
use causette_store::{ConversationStore, MemoryStore};

fn user(name: &str) -> UserSummary {
    UserSummary {
        id: UserId::new(),
        display_name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        photo_url: None,
    }
}

async fn wait_for_session(client: &ChatClient) -> Arc<Session> {
    loop {
        if let Some(session) = client.session().await {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    causette_client::init_tracing();
    info!("Starting {} demo v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 1. Shared backends play the hosted services; one client per identity
    // -----------------------------------------------------------------------
    let store = Arc::new(MemoryStore::new());
    let relay = Arc::new(MemoryRelay::new());
    let presence = Arc::new(MemoryPresence::new());
    let push = Arc::new(MemoryPushGateway::new());

    let ada = user("Ada");
    let grace = user("Grace");

    let ada_identity = Arc::new(MemoryIdentity::new());
    let grace_identity = Arc::new(MemoryIdentity::new());

    let backends_for = |identity: Arc<MemoryIdentity>| Backends {
        store: store.clone(),
        relay: relay.clone(),
        presence: presence.clone(),
        push: push.clone(),
        identity,
        notifier: Arc::new(LogSink),
        windows: Arc::new(NoWindows),
    };

    let ada_client = ChatClient::start(backends_for(ada_identity.clone()), ClientConfig::from_env());
    let grace_client =
        ChatClient::start(backends_for(grace_identity.clone()), ClientConfig::from_env());

    // -----------------------------------------------------------------------
    // 2. Sign both identities in
    // -----------------------------------------------------------------------
    ada_identity.sign_in(ada.clone());
    grace_identity.sign_in(grace.clone());
    let ada_session = wait_for_session(&ada_client).await;
    let grace_session = wait_for_session(&grace_client).await;

    // -----------------------------------------------------------------------
    // 3. Ada starts the conversation and sends the first message
    // -----------------------------------------------------------------------
    let conversation = ada_session
        .composer()
        .create_or_reuse_conversation(&[grace.id], None)
        .await?;
    info!(conversation = %conversation.id, "Conversation ready");

    ada_session
        .typing()
        .notify_typing(conversation.id, true)
        .await;
    ada_session
        .composer()
        .send_message(conversation.id, "Hello Grace!", None)
        .await?;
    ada_session
        .typing()
        .notify_typing(conversation.id, false)
        .await;

    // -----------------------------------------------------------------------
    // 4. Grace's list stream picks the conversation up
    // -----------------------------------------------------------------------
    let mut grace_list = grace_session.synchronizer().conversation_list();
    while let Some(list) = grace_list.recv().await {
        if let Some(summary) = list.conversations.first() {
            if summary.unread_count > 0 {
                info!(
                    conversation = %summary.id,
                    unread = summary.unread_count,
                    preview = %summary.last_message.as_ref().map(|m| m.text.as_str()).unwrap_or(""),
                    "Grace sees the new conversation"
                );
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // 5. Grace opens it: unread clears, receipts land, then she replies
    // -----------------------------------------------------------------------
    let mut opened = grace_session.open_conversation(conversation.id);
    if let Some(DetailState::Ready(view)) = opened.detail.recv().await {
        info!(
            archived = view.archived,
            unread = view.unread_count,
            "Grace opened the conversation"
        );
    }
    if let Some(MessageState::Ready(messages)) = opened.messages.recv().await {
        info!(count = messages.len(), "Grace sees the message history");
    }

    let reply = grace_session
        .composer()
        .send_message(conversation.id, "Hi Ada!", None)
        .await?;

    grace_session
        .composer()
        .add_reaction(conversation.id, reply, "🎉")
        .await?;

    // -----------------------------------------------------------------------
    // 6. Archive round-trip: a new message resurfaces the thread
    // -----------------------------------------------------------------------
    let archived = ada_session.composer().toggle_archive(conversation.id).await?;
    info!(archived, "Ada archived the conversation");
    ada_session
        .composer()
        .send_message(conversation.id, "One more thing...", None)
        .await?;
    let after = store
        .get_conversation(conversation.id)
        .await?
        .map(|conv| conv.archived_by.is_empty())
        .unwrap_or(false);
    info!(unarchived_for_everyone = after, "Sending resurfaced the thread");

    // Let the streams and notification loops drain before teardown.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // -----------------------------------------------------------------------
    // 7. Sign out and shut down
    // -----------------------------------------------------------------------
    grace_session.close_conversation();
    ada_identity.sign_out();
    grace_identity.sign_out();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ada_client.shutdown().await;
    grace_client.shutdown().await;

    info!("Demo complete");
    Ok(())
}
