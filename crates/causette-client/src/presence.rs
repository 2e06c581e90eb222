//! Presence lifecycle for the signed-in user.

use chrono::Utc;
use tracing::{debug, warn};

use causette_net::PresenceSession;
use causette_shared::{PresenceRecord, Subscription, UserId, UserProfile};
use causette_store::{ConversationOp, WriteBatch};

use crate::error::Result;
use crate::session::SessionContext;

/// Keeps the local user's presence record current and mirrors their profile
/// into the conversations they participate in.
///
/// Startup failures propagate; everything after that is best-effort and only
/// logged, so a flaky presence backend cannot take the session down.
pub struct PresenceTracker {
    ctx: SessionContext,
    session: Box<dyn PresenceSession>,
}

impl PresenceTracker {
    /// Connect, arm the disconnect write, go online, and fan the profile out.
    ///
    /// The disconnect write is armed before the online write so an abnormal
    /// exit between the two cannot leave the user stuck online.
    pub async fn start(ctx: SessionContext) -> Result<Self> {
        let session = ctx.presence.connect(ctx.user.id).await?;
        let now = Utc::now();
        session.on_disconnect(PresenceRecord::offline(now)).await?;
        session.set(PresenceRecord::online(now)).await?;

        let tracker = Self { ctx, session };
        tracker.publish_profile(true).await;
        Ok(tracker)
    }

    /// Presence stream for another user.
    pub fn watch_user(&self, user: UserId) -> Subscription<PresenceRecord> {
        self.ctx.presence.watch(user)
    }

    /// Go offline and end the presence session.
    pub async fn shutdown(&self) {
        let now = Utc::now();
        if let Err(error) = self.session.set(PresenceRecord::offline(now)).await {
            warn!(user = %self.ctx.user.id, %error, "Offline write failed");
        }
        self.publish_profile(false).await;
        if let Err(error) = self.session.disconnect().await {
            warn!(user = %self.ctx.user.id, %error, "Presence disconnect failed");
        }
    }

    /// Upsert the directory profile and refresh the cached participant
    /// details in every conversation the user is part of.
    async fn publish_profile(&self, online: bool) {
        let user = &self.ctx.user;
        let now = Utc::now();
        let profile = UserProfile {
            id: user.id,
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            photo_url: user.photo_url.clone(),
            online,
            last_seen: Some(now),
        };
        if let Err(error) = self.ctx.store.upsert_profile(profile).await {
            warn!(user = %user.id, %error, "Profile upsert failed");
        }

        let conversations = match self.ctx.store.list_conversations(user.id).await {
            Ok(conversations) => conversations,
            Err(error) => {
                warn!(user = %user.id, %error, "Participant detail refresh skipped");
                return;
            }
        };
        if conversations.is_empty() {
            return;
        }

        let details = user.participant_summary(online, Some(now));
        let mut batch = WriteBatch::new();
        for conversation in &conversations {
            batch.conversation(
                conversation.id,
                ConversationOp::PutParticipantDetails {
                    user: user.id,
                    details: details.clone(),
                },
            );
        }
        match self.ctx.store.commit(batch).await {
            Ok(()) => debug!(
                user = %user.id,
                conversations = conversations.len(),
                online,
                "Participant details refreshed"
            ),
            Err(error) => warn!(user = %user.id, %error, "Participant detail refresh failed"),
        }
    }
}
