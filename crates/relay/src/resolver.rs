use std::collections::HashSet;

use shared::{
    domain::{ChatId, ChatKind, UserId},
    error::ApiError,
};
use storage::StoredUser;
use tracing::{debug, info};

use crate::{persistence, RelayContext};

/// A lost creation race costs one extra lookup; more than a couple of rounds
/// means the store is misbehaving.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Returns the one private chat between `a` and `b`, creating it on first
/// contact. Argument order does not matter.
pub async fn resolve_private(
    ctx: &RelayContext,
    a: UserId,
    b: UserId,
) -> Result<ChatId, ApiError> {
    if a == b {
        return Err(ApiError::validation("you cannot start a chat with yourself"));
    }

    for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
        if let Some(chat_id) = ctx
            .store
            .find_private_chat(a, b)
            .await
            .map_err(persistence)?
        {
            return Ok(chat_id);
        }

        match ctx
            .store
            .create_private_chat(a, b)
            .await
            .map_err(persistence)?
        {
            Some(chat_id) => {
                debug!(%chat_id, user_a = %a, user_b = %b, "created private chat");
                return Ok(chat_id);
            }
            None => debug!(attempt, user_a = %a, user_b = %b, "private chat created concurrently"),
        }
    }

    Err(ApiError::persistence("could not resolve private chat"))
}

pub async fn find_peer(ctx: &RelayContext, username: &str) -> Result<StoredUser, ApiError> {
    ctx.store
        .find_user(username)
        .await
        .map_err(persistence)?
        .ok_or_else(|| ApiError::not_found(format!("user {username} not found")))
}

/// Resolves a peer username to the peer and the private chat with them.
pub async fn resolve_peer(
    ctx: &RelayContext,
    requester: UserId,
    username: &str,
) -> Result<(StoredUser, ChatId), ApiError> {
    let peer = find_peer(ctx, username).await?;
    let chat_id = resolve_private(ctx, requester, peer.user_id).await?;
    Ok((peer, chat_id))
}

/// Checks that `chat_id` is a group the requester belongs to. Unknown ids,
/// private chats and foreign groups are all reported the same way.
///
/// Non-members get NotFound rather than a permission error so a numeric
/// target cannot reveal which group ids exist, and so nobody can
/// post into or read the history of a group they were never added to.
pub async fn resolve_group(
    ctx: &RelayContext,
    chat_id: ChatId,
    requester: UserId,
) -> Result<ChatId, ApiError> {
    let not_found = || ApiError::not_found(format!("group {chat_id} not found"));

    let chat = ctx
        .store
        .load_chat(chat_id)
        .await
        .map_err(persistence)?
        .ok_or_else(not_found)?;
    if chat.kind != ChatKind::Group {
        return Err(not_found());
    }
    if !ctx
        .store
        .is_member(chat_id, requester)
        .await
        .map_err(persistence)?
    {
        return Err(not_found());
    }
    Ok(chat_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedGroup {
    pub chat_id: ChatId,
    pub title: String,
    pub members: Vec<UserId>,
}

/// Creates a group owned by `creator_id`. The member list is deduplicated and
/// always contains the creator; every username must exist before anything is
/// written, and the chat plus memberships are committed together.
pub async fn create_group(
    ctx: &RelayContext,
    creator_id: UserId,
    creator_username: &str,
    title: &str,
    member_usernames: &[String],
) -> Result<CreatedGroup, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("group name is required"));
    }

    let mut seen = HashSet::new();
    let mut members = Vec::new();
    seen.insert(creator_username.to_string());
    members.push(creator_id);

    for username in member_usernames.iter().map(|name| name.trim()) {
        if username.is_empty() || !seen.insert(username.to_string()) {
            continue;
        }
        let user_id = ctx
            .store
            .find_user_id(username)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApiError::not_found(format!("user {username} not found")))?;
        if !members.contains(&user_id) {
            members.push(user_id);
        }
    }

    let chat_id = ctx
        .store
        .create_group_chat(title, creator_id, &members)
        .await
        .map_err(persistence)?;
    info!(%chat_id, creator = %creator_id, members = members.len(), "created group chat");

    Ok(CreatedGroup {
        chat_id,
        title: title.to_string(),
        members,
    })
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
