use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use shared::{
    domain::MessageId,
    error::ErrorCode,
    protocol::{ChatPreview, UserSummary},
};
use storage::{ChatStore, NewUser, Storage, StoredChat, StoredCredential, StoredMessage, StoredUser};

use super::*;
use crate::{
    test_support::{memory_context, register_user, test_settings, TestClient},
    RelaySettings,
};

/// Delegates to a real store but refuses to persist messages.
struct ReadOnlyStore(Storage);

#[async_trait]
impl ChatStore for ReadOnlyStore {
    async fn health_check(&self) -> Result<()> {
        self.0.health_check().await
    }

    async fn find_user(&self, username: &str) -> Result<Option<StoredUser>> {
        self.0.find_user(username).await
    }

    async fn load_credential(&self, username: &str) -> Result<Option<StoredCredential>> {
        self.0.load_credential(username).await
    }

    async fn create_user(&self, new_user: &NewUser<'_>) -> Result<Option<UserId>> {
        self.0.create_user(new_user).await
    }

    async fn touch_last_login(&self, user_id: UserId) -> Result<()> {
        self.0.touch_last_login(user_id).await
    }

    async fn find_private_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>> {
        self.0.find_private_chat(a, b).await
    }

    async fn create_private_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>> {
        self.0.create_private_chat(a, b).await
    }

    async fn load_chat(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        self.0.load_chat(chat_id).await
    }

    async fn create_group_chat(
        &self,
        title: &str,
        creator_id: UserId,
        members: &[UserId],
    ) -> Result<ChatId> {
        self.0.create_group_chat(title, creator_id, members).await
    }

    async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        self.0.chat_members(chat_id).await
    }

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        self.0.is_member(chat_id, user_id).await
    }

    async fn append_message(
        &self,
        _chat_id: ChatId,
        _sender_id: UserId,
        _content: &str,
        _sent_at: DateTime<Utc>,
    ) -> Result<MessageId> {
        Err(anyhow!("disk I/O error"))
    }

    async fn recent_messages(&self, chat_id: ChatId, limit: u32) -> Result<Vec<StoredMessage>> {
        self.0.recent_messages(chat_id, limit).await
    }

    async fn chat_previews_for(&self, user_id: UserId) -> Result<Vec<ChatPreview>> {
        self.0.chat_previews_for(user_id).await
    }

    async fn chat_preview(&self, user_id: UserId, chat_id: ChatId) -> Result<Option<ChatPreview>> {
        self.0.chat_preview(user_id, chat_id).await
    }

    async fn search_users(&self, fragment: &str, limit: u32) -> Result<Vec<UserSummary>> {
        self.0.search_users(fragment, limit).await
    }
}

fn message(event: ServerEvent) -> MessageFrame {
    match event {
        ServerEvent::Message(frame) => frame,
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn zero_or_missing_client_timestamp_uses_server_clock() {
    let before = Utc::now().timestamp();
    assert!(assign_timestamp(None).timestamp() >= before);
    assert!(assign_timestamp(Some(0)).timestamp() >= before);
    assert_eq!(assign_timestamp(Some(1_700_000_000)).timestamp(), 1_700_000_000);
}

#[tokio::test]
async fn private_message_is_echoed_delivered_and_refreshes_both_lists() {
    let ctx = memory_context().await;
    register_user(&ctx, "alice", "Alice").await;
    register_user(&ctx, "bob", "Bob").await;
    let mut alice = TestClient::signed_in(&ctx, "alice").await;
    let mut bob = TestClient::signed_in(&ctx, "bob").await;

    alice.send(json!({"type": "message", "to": "bob", "content": "hi", "timestamp": 1_700_000_000}));

    let echo = message(alice.recv().await);
    assert_eq!(echo.from, "alice");
    assert_eq!(echo.to, "bob");
    assert_eq!(echo.display_name, "Alice Example");
    assert_eq!(echo.timestamp, 1_700_000_000);

    let delivered = message(bob.recv().await);
    assert_eq!(delivered, echo);

    for client in [&mut alice, &mut bob] {
        match client.recv().await {
            ServerEvent::Chatlist { chats } => {
                assert_eq!(chats.len(), 1);
                assert_eq!(chats[0].last_msg, "hi");
                assert_eq!(chats[0].last_ts, 1_700_000_000);
            }
            other => panic!("expected chatlist, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn offline_peer_still_gets_the_message_persisted() {
    let ctx = memory_context().await;
    let alice_id = register_user(&ctx, "alice", "Alice").await;
    let bob_id = register_user(&ctx, "bob", "Bob").await;
    let mut alice = TestClient::signed_in(&ctx, "alice").await;

    alice.send(json!({"type": "message", "to": "bob", "content": "are you there?"}));
    assert_eq!(message(alice.recv().await).content, "are you there?");
    assert!(matches!(alice.recv().await, ServerEvent::Chatlist { .. }));

    let chat_id = ctx
        .store
        .find_private_chat(alice_id, bob_id)
        .await
        .expect("lookup")
        .expect("chat created on first message");
    let stored = ctx.store.recent_messages(chat_id, 10).await.expect("history");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "are you there?");
}

#[tokio::test]
async fn failed_persist_reaches_only_the_sender() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = RelayContext::new(ReadOnlyStore(storage), test_settings());
    register_user(&ctx, "alice", "Alice").await;
    register_user(&ctx, "bob", "Bob").await;
    let mut alice = TestClient::signed_in(&ctx, "alice").await;
    let mut bob = TestClient::signed_in(&ctx, "bob").await;

    alice.send(json!({"type": "message", "to": "bob", "content": "lost"}));

    match alice.recv().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Persistence),
        other => panic!("expected persistence error, got {other:?}"),
    }
    bob.expect_quiet().await;
    alice.expect_quiet().await;
}

#[tokio::test]
async fn group_message_fans_out_to_online_members_only() {
    let ctx = memory_context().await;
    let alice_id = register_user(&ctx, "alice", "Alice").await;
    register_user(&ctx, "bob", "Bob").await;
    register_user(&ctx, "carol", "Carol").await;
    register_user(&ctx, "dave", "Dave").await;
    let group = resolver::create_group(
        &ctx,
        alice_id,
        "alice",
        "Crew",
        &["bob".to_string(), "carol".to_string()],
    )
    .await
    .expect("group");

    let mut alice = TestClient::signed_in(&ctx, "alice").await;
    let mut bob = TestClient::signed_in(&ctx, "bob").await;
    let mut dave = TestClient::signed_in(&ctx, "dave").await;

    alice.send(json!({"type": "message", "to": group.chat_id.to_string(), "content": "standup"}));

    let echo = message(alice.recv().await);
    assert_eq!(echo.to, group.chat_id.to_string());
    assert_eq!(echo.chat_id, group.chat_id);
    assert_eq!(message(bob.recv().await), echo);
    dave.expect_quiet().await;

    dave.send(json!({"type": "message", "to": group.chat_id.to_string(), "content": "let me in"}));
    match dave.recv().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("expected not found, got {other:?}"),
    }
    assert_eq!(
        ctx.store
            .recent_messages(group.chat_id, 10)
            .await
            .expect("history")
            .len(),
        1
    );
}

#[tokio::test]
async fn history_is_ascending_and_capped() {
    let ctx = RelayContext::new(
        Storage::new("sqlite::memory:").await.expect("db"),
        RelaySettings {
            history_limit: 3,
            ..test_settings()
        },
    );
    let alice_id = register_user(&ctx, "alice", "Alice").await;
    let bob_id = register_user(&ctx, "bob", "Bob").await;
    let chat_id = resolver::resolve_private(&ctx, alice_id, bob_id)
        .await
        .expect("chat");
    for (offset, (sender, content)) in [
        (alice_id, "one"),
        (bob_id, "two"),
        (alice_id, "three"),
        (bob_id, "four"),
    ]
    .into_iter()
    .enumerate()
    {
        let sent_at = DateTime::from_timestamp(1_000 + offset as i64, 0).expect("timestamp");
        ctx.store
            .append_message(chat_id, sender, content, sent_at)
            .await
            .expect("append");
    }

    let mut alice = TestClient::signed_in(&ctx, "alice").await;
    alice.send(json!({"type": "history", "to": "bob"}));

    let frames = [
        message(alice.recv().await),
        message(alice.recv().await),
        message(alice.recv().await),
    ];
    let contents: Vec<_> = frames.iter().map(|f| f.content.as_str()).collect();
    assert_eq!(contents, vec!["two", "three", "four"]);
    assert_eq!((frames[0].from.as_str(), frames[0].to.as_str()), ("bob", "alice"));
    assert_eq!((frames[1].from.as_str(), frames[1].to.as_str()), ("alice", "bob"));
    alice.expect_quiet().await;
}

#[tokio::test]
async fn history_never_creates_a_chat() {
    let ctx = memory_context().await;
    let alice_id = register_user(&ctx, "alice", "Alice").await;
    register_user(&ctx, "bob", "Bob").await;
    let mut alice = TestClient::signed_in(&ctx, "alice").await;

    alice.send(json!({"type": "history", "to": "bob"}));
    alice.expect_quiet().await;
    assert!(ctx
        .store
        .chat_previews_for(alice_id)
        .await
        .expect("previews")
        .is_empty());

    alice.send(json!({"type": "history", "to": "nobody"}));
    match alice.recv().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_messages_are_rejected_before_persisting() {
    let ctx = memory_context().await;
    register_user(&ctx, "alice", "Alice").await;
    let mut alice = TestClient::signed_in(&ctx, "alice").await;

    for frame in [
        json!({"type": "message", "to": "alice", "content": "me"}),
        json!({"type": "message", "to": "", "content": "nobody"}),
        json!({"type": "message", "to": "bob", "content": "   "}),
    ] {
        alice.send(frame);
        match alice.recv().await {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Validation),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
