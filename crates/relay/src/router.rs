use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, ChatTarget, UserId},
    error::ApiError,
    protocol::{MessageFrame, ServerEvent},
};
use tracing::{debug, warn};

use crate::{persistence, projector, registry::Session, resolver, RelayContext};

/// Client timestamps of zero mean "unset".
pub fn assign_timestamp(client_timestamp: Option<i64>) -> DateTime<Utc> {
    client_timestamp
        .filter(|ts| *ts != 0)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now)
}

fn parse_target(raw: &str) -> Result<ChatTarget, ApiError> {
    ChatTarget::parse(raw).ok_or_else(|| ApiError::validation("a target is required"))
}

/// Persists one message and fans it out.
///
/// The message is written before anyone sees it; if the write fails only the
/// sender hears about it. The sender always gets an echo, online recipients
/// get a copy, and everybody who saw the message gets a refreshed chat list.
pub async fn route(
    ctx: &RelayContext,
    sender: &Session,
    to: &str,
    content: &str,
    client_timestamp: Option<i64>,
) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("message content is required"));
    }
    let target = parse_target(to)?;

    let (chat_id, peer_username) = match &target {
        ChatTarget::Peer(username) => {
            let (peer, chat_id) = resolver::resolve_peer(ctx, sender.user_id, username).await?;
            (chat_id, Some(peer.username))
        }
        ChatTarget::Group(chat_id) => (
            resolver::resolve_group(ctx, *chat_id, sender.user_id).await?,
            None,
        ),
    };

    let sent_at = assign_timestamp(client_timestamp);
    let message_id = ctx
        .store
        .append_message(chat_id, sender.user_id, content, sent_at)
        .await
        .map_err(persistence)?;
    debug!(%message_id, %chat_id, sender = %sender.user_id, "message persisted");

    let event = ServerEvent::Message(MessageFrame {
        chat_id,
        from: sender.username.clone(),
        to: target.to_string(),
        content: content.to_string(),
        display_name: sender.display_name.clone(),
        timestamp: sent_at.timestamp(),
    });

    sender.connection.send(event.clone());

    let recipients: Vec<Session> = match peer_username {
        Some(username) => ctx
            .sessions
            .session_for_username(&username)
            .into_iter()
            .collect(),
        None => online_group_members(ctx, chat_id, sender.user_id).await,
    };

    let mut delivered = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if recipient.connection.id() == sender.connection.id() {
            continue;
        }
        if recipient.connection.send(event.clone()) {
            delivered.push(recipient);
        }
    }

    projector::push(ctx, &sender.connection, sender.user_id).await;
    for recipient in &delivered {
        projector::push(ctx, &recipient.connection, recipient.user_id).await;
    }
    Ok(())
}

/// The message is already durable at this point, so a failed membership read
/// only costs live delivery; members see it in their history.
async fn online_group_members(ctx: &RelayContext, chat_id: ChatId, sender: UserId) -> Vec<Session> {
    match ctx.store.chat_members(chat_id).await {
        Ok(members) => {
            let others: Vec<UserId> = members.into_iter().filter(|id| *id != sender).collect();
            ctx.sessions.sessions_for_users(&others)
        }
        Err(error) => {
            warn!(%chat_id, error = %format!("{error:#}"), "group fan-out skipped");
            Vec::new()
        }
    }
}

/// Up to `history_limit` most recent messages of the chat behind `to`, oldest
/// first. Looking at history never creates a chat.
pub async fn history(
    ctx: &RelayContext,
    requester: &Session,
    to: &str,
) -> Result<Vec<MessageFrame>, ApiError> {
    let target = parse_target(to)?;

    let (chat_id, peer_username) = match &target {
        ChatTarget::Peer(username) => {
            let peer = resolver::find_peer(ctx, username).await?;
            if peer.user_id == requester.user_id {
                return Ok(Vec::new());
            }
            let chat_id = ctx
                .store
                .find_private_chat(requester.user_id, peer.user_id)
                .await
                .map_err(persistence)?;
            match chat_id {
                Some(chat_id) => (chat_id, Some(peer.username)),
                None => return Ok(Vec::new()),
            }
        }
        ChatTarget::Group(chat_id) => (
            resolver::resolve_group(ctx, *chat_id, requester.user_id).await?,
            None,
        ),
    };

    let mut messages = ctx
        .store
        .recent_messages(chat_id, ctx.settings.history_limit)
        .await
        .map_err(persistence)?;
    messages.reverse();

    Ok(messages
        .into_iter()
        .map(|message| {
            let to = match &peer_username {
                Some(peer) if message.sender_id == requester.user_id => peer.clone(),
                Some(_) => requester.username.clone(),
                None => chat_id.to_string(),
            };
            MessageFrame {
                chat_id,
                from: message.sender_username,
                to,
                content: message.content,
                display_name: message.sender_display_name,
                timestamp: message.sent_at.timestamp(),
            }
        })
        .collect())
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
