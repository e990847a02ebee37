use shared::{domain::UserId, error::ApiError, protocol::ChatPreview, protocol::ServerEvent};
use tracing::{debug, warn};

use crate::{persistence, registry::ConnectionHandle, RelayContext};

/// The user's chats, most recent activity first.
pub async fn project(ctx: &RelayContext, user_id: UserId) -> Result<Vec<ChatPreview>, ApiError> {
    ctx.store
        .chat_previews_for(user_id)
        .await
        .map_err(persistence)
}

/// Best-effort refresh of one connection's chat list. Failures are logged and
/// swallowed so they never fail the operation that triggered them.
pub async fn push(ctx: &RelayContext, connection: &ConnectionHandle, user_id: UserId) {
    match project(ctx, user_id).await {
        Ok(chats) => {
            if !connection.send(ServerEvent::Chatlist { chats }) {
                debug!(connection = %connection.id(), %user_id, "chat list not delivered");
            }
        }
        Err(error) => warn!(%user_id, %error, "skipping chat list refresh"),
    }
}

/// Refreshes every online session belonging to `user_ids`.
pub async fn push_to_users(ctx: &RelayContext, user_ids: &[UserId]) {
    for session in ctx.sessions.sessions_for_users(user_ids) {
        push(ctx, &session.connection, session.user_id).await;
    }
}
