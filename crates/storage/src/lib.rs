use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, ChatKind, MessageId, UserId},
    protocol::{ChatPreview, UserSummary},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub user: StoredUser,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub password_hash: &'a str,
}

impl NewUser<'_> {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub creator_id: Option<UserId>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub sender_display_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Durable relational state behind the relay: users, chats, memberships and
/// the append-only message log.
///
/// Lookups return `Ok(None)` for absence. Creation methods that can collide
/// with a uniqueness constraint also return `Ok(None)` so callers can tell a
/// conflict apart from a failed store.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn find_user(&self, username: &str) -> Result<Option<StoredUser>>;

    async fn find_user_id(&self, username: &str) -> Result<Option<UserId>> {
        Ok(self.find_user(username).await?.map(|user| user.user_id))
    }

    async fn load_credential(&self, username: &str) -> Result<Option<StoredCredential>>;

    /// `None` when the username is already taken.
    async fn create_user(&self, new_user: &NewUser<'_>) -> Result<Option<UserId>>;

    async fn touch_last_login(&self, user_id: UserId) -> Result<()>;

    /// The pair is unordered.
    async fn find_private_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>>;

    /// Creates the chat and both membership rows atomically. `None` when a
    /// private chat for the pair was committed concurrently.
    async fn create_private_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>>;

    async fn load_chat(&self, chat_id: ChatId) -> Result<Option<StoredChat>>;

    /// Creates the group and every membership row in one transaction.
    async fn create_group_chat(
        &self,
        title: &str,
        creator_id: UserId,
        members: &[UserId],
    ) -> Result<ChatId>;

    async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>>;

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;

    async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId>;

    /// Newest first, ties on `sent_at` broken by insertion order.
    async fn recent_messages(&self, chat_id: ChatId, limit: u32) -> Result<Vec<StoredMessage>>;

    /// Most recent activity first.
    async fn chat_previews_for(&self, user_id: UserId) -> Result<Vec<ChatPreview>>;

    async fn chat_preview(&self, user_id: UserId, chat_id: ChatId) -> Result<Option<ChatPreview>>;

    async fn search_users(&self, fragment: &str, limit: u32) -> Result<Vec<UserSummary>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let in_memory = database_url.starts_with(MEMORY_URL);
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` opens its own database, so the
        // pool is pinned to a single connection that is never recycled.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

const PREVIEW_SELECT: &str = "
    SELECT
        c.id AS chat_id,
        c.is_group AS is_group,
        c.title AS title,
        (SELECT u.username
           FROM chat_members peer
           JOIN users u ON u.id = peer.user_id
          WHERE peer.chat_id = c.id AND peer.user_id <> ?1
          LIMIT 1) AS peer_username,
        (SELECT u.display_name
           FROM chat_members peer
           JOIN users u ON u.id = peer.user_id
          WHERE peer.chat_id = c.id AND peer.user_id <> ?1
          LIMIT 1) AS peer_display_name,
        COALESCE((SELECT m.content
                    FROM messages m
                   WHERE m.chat_id = c.id
                   ORDER BY m.sent_at DESC, m.id DESC
                   LIMIT 1), '') AS last_msg,
        COALESCE((SELECT m.sent_at
                    FROM messages m
                   WHERE m.chat_id = c.id
                   ORDER BY m.sent_at DESC, m.id DESC
                   LIMIT 1), 0) AS last_ts
    FROM chats c
    JOIN chat_members me ON me.chat_id = c.id AND me.user_id = ?1";

fn preview_from_row(row: &SqliteRow) -> Result<ChatPreview> {
    let chat_id = ChatId(row.try_get::<i64, _>("chat_id")?);
    let is_group = row.try_get::<bool, _>("is_group")?;
    let (peer, display_name) = if is_group {
        (
            chat_id.to_string(),
            row.try_get::<Option<String>, _>("title")?
                .unwrap_or_default(),
        )
    } else {
        (
            row.try_get::<Option<String>, _>("peer_username")?
                .unwrap_or_default(),
            row.try_get::<Option<String>, _>("peer_display_name")?
                .unwrap_or_default(),
        )
    };
    Ok(ChatPreview {
        chat_id,
        peer,
        display_name,
        is_group,
        last_msg: row.try_get::<String, _>("last_msg")?,
        last_ts: row.try_get::<i64, _>("last_ts")?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<StoredUser> {
    Ok(StoredUser {
        user_id: UserId(row.try_get::<i64, _>("id")?),
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
    })
}

fn ordered_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// `%` and `_` in the fragment match literally.
fn like_pattern(fragment: &str) -> String {
    let mut pattern = String::with_capacity(fragment.len() + 2);
    pattern.push('%');
    for ch in fragment.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn timestamp_to_datetime(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

#[async_trait]
impl ChatStore for Storage {
    async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn find_user(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, display_name FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up user")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn load_credential(&self, username: &str) -> Result<Option<StoredCredential>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, password_hash FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load credential")?;
        row.map(|r| -> Result<StoredCredential> {
            Ok(StoredCredential {
                user: user_from_row(&r)?,
                password_hash: r.try_get("password_hash")?,
            })
        })
        .transpose()
    }

    async fn create_user(&self, new_user: &NewUser<'_>) -> Result<Option<UserId>> {
        let display_name = new_user.display_name();
        let row = sqlx::query(
            "INSERT INTO users (
                 username, first_name, last_name, display_name, password_hash,
                 username_folded, display_name_folded
             )
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(username) DO NOTHING
             RETURNING id",
        )
        .bind(new_user.username)
        .bind(new_user.first_name)
        .bind(new_user.last_name)
        .bind(display_name.as_str())
        .bind(new_user.password_hash)
        .bind(new_user.username.to_lowercase())
        .bind(display_name.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert user")?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    async fn touch_last_login(&self, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET last_login_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .context("failed to update last_login_at")?;
        Ok(())
    }

    async fn find_private_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>> {
        let (low, high) = ordered_pair(a, b);
        let chat_id: Option<i64> = sqlx::query_scalar(
            "SELECT chat_id FROM private_chats WHERE user_low = ? AND user_high = ?",
        )
        .bind(low.0)
        .bind(high.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up private chat")?;
        Ok(chat_id.map(ChatId))
    }

    async fn create_private_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>> {
        if a == b {
            bail!("a private chat needs two distinct users");
        }
        let (low, high) = ordered_pair(a, b);
        let mut tx = self.pool.begin().await?;

        let chat_id: i64 =
            sqlx::query_scalar("INSERT INTO chats (is_group) VALUES (0) RETURNING id")
                .fetch_one(&mut *tx)
                .await
                .context("failed to insert private chat")?;

        let claimed = sqlx::query(
            "INSERT INTO private_chats (user_low, user_high, chat_id) VALUES (?, ?, ?)",
        )
        .bind(low.0)
        .bind(high.0)
        .bind(chat_id)
        .execute(&mut *tx)
        .await;
        match claimed {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(error) => return Err(error).context("failed to claim private chat pair"),
        }

        sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2), (?1, ?3)")
            .bind(chat_id)
            .bind(low.0)
            .bind(high.0)
            .execute(&mut *tx)
            .await
            .context("failed to insert private chat members")?;

        tx.commit().await?;
        Ok(Some(ChatId(chat_id)))
    }

    async fn load_chat(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        let row = sqlx::query("SELECT id, is_group, title, creator_id FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load chat")?;
        Ok(row.map(|r| StoredChat {
            chat_id: ChatId(r.get::<i64, _>(0)),
            kind: if r.get::<bool, _>(1) {
                ChatKind::Group
            } else {
                ChatKind::Private
            },
            title: r.get::<Option<String>, _>(2),
            creator_id: r.get::<Option<i64>, _>(3).map(UserId),
        }))
    }

    async fn create_group_chat(
        &self,
        title: &str,
        creator_id: UserId,
        members: &[UserId],
    ) -> Result<ChatId> {
        let mut tx = self.pool.begin().await?;

        let chat_id: i64 = sqlx::query_scalar(
            "INSERT INTO chats (is_group, title, creator_id) VALUES (1, ?, ?) RETURNING id",
        )
        .bind(title)
        .bind(creator_id.0)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert group chat")?;

        for user_id in std::iter::once(&creator_id).chain(members) {
            sqlx::query(
                "INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to add user {user_id} to group {chat_id}"))?;
        }

        tx.commit().await?;
        Ok(ChatId(chat_id))
    }

    async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM chat_members WHERE chat_id = ? ORDER BY user_id ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list chat members")?;
        Ok(ids.into_iter().map(UserId).collect())
    }

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
                .bind(chat_id.0)
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await
                .context("failed to check chat membership")?;
        Ok(found.is_some())
    }

    async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (chat_id, sender_id, content, sent_at) VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(sent_at.timestamp())
        .fetch_one(&self.pool)
        .await
        .context("failed to append message")?;
        Ok(MessageId(id))
    }

    async fn recent_messages(&self, chat_id: ChatId, limit: u32) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT m.id, m.chat_id, m.sender_id, u.username, u.display_name, m.content, m.sent_at
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = ?
             ORDER BY m.sent_at DESC, m.id DESC
             LIMIT ?",
        )
        .bind(chat_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load recent messages")?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                chat_id: ChatId(r.get::<i64, _>(1)),
                sender_id: UserId(r.get::<i64, _>(2)),
                sender_username: r.get::<String, _>(3),
                sender_display_name: r.get::<String, _>(4),
                content: r.get::<String, _>(5),
                sent_at: timestamp_to_datetime(r.get::<i64, _>(6)),
            })
            .collect())
    }

    async fn chat_previews_for(&self, user_id: UserId) -> Result<Vec<ChatPreview>> {
        let query = format!("{PREVIEW_SELECT} ORDER BY last_ts DESC, c.id DESC");
        let rows = sqlx::query(&query)
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await
            .context("failed to load chat previews")?;
        rows.iter().map(preview_from_row).collect()
    }

    async fn chat_preview(&self, user_id: UserId, chat_id: ChatId) -> Result<Option<ChatPreview>> {
        let query = format!("{PREVIEW_SELECT} WHERE c.id = ?2");
        let row = sqlx::query(&query)
            .bind(user_id.0)
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load chat preview")?;
        row.as_ref().map(preview_from_row).transpose()
    }

    async fn search_users(&self, fragment: &str, limit: u32) -> Result<Vec<UserSummary>> {
        let rows = sqlx::query(
            "SELECT username, display_name
             FROM users
             WHERE username_folded LIKE ?1 ESCAPE '\\'
                OR display_name_folded LIKE ?1 ESCAPE '\\'
             ORDER BY username ASC
             LIMIT ?2",
        )
        .bind(like_pattern(&fragment.to_lowercase()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to search users")?;
        Ok(rows
            .into_iter()
            .map(|r| UserSummary {
                username: r.get::<String, _>(0),
                display_name: r.get::<String, _>(1),
            })
            .collect())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
