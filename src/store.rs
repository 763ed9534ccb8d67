use crate::{
    chat::{ChatMessage, ChatRoom},
    entity::{canonical_pair, UserId},
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Durable storage of chat rooms and messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Returns the unique room for the unordered pair, creating it on first use.
    async fn find_or_create_room(&self, a: &UserId, b: &UserId) -> Result<ChatRoom>;

    /// Appends a message to a room. The sender must be one of its participants.
    async fn create_message(&self, room_id: &str, sender: &UserId, content: &str)
        -> Result<ChatMessage>;

    /// Messages of a room, oldest first.
    async fn list_messages(&self, room_id: &str, limit: i64, offset: i64)
        -> Result<Vec<ChatMessage>>;

    /// Marks every unread message in the room not sent by `reader` as read.
    /// Returns how many messages changed.
    async fn mark_read(&self, room_id: &str, reader: &UserId) -> Result<u64>;

    async fn is_participant(&self, room_id: &str, user: &UserId) -> Result<bool>;

    async fn room(&self, room_id: &str) -> Result<Option<ChatRoom>>;

    /// Rooms the user takes part in, most recently active first.
    async fn rooms_for_user(&self, user: &UserId) -> Result<Vec<ChatRoom>>;
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database. The pool is pinned to one connection that
    /// never expires, since each SQLite memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_rooms (
                id TEXT PRIMARY KEY,
                user_1 TEXT NOT NULL,
                user_2 TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                last_message_at DATETIME,
                UNIQUE (user_1, user_2)
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                chat_room_id TEXT NOT NULL REFERENCES chat_rooms(id),
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_room_created
                ON chat_messages(chat_room_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }
}

fn room_from_row(row: &SqliteRow) -> Result<ChatRoom> {
    Ok(ChatRoom {
        id: row.try_get("id")?,
        user_1: UserId::new(row.try_get::<String, _>("user_1")?),
        user_2: UserId::new(row.try_get::<String, _>("user_2")?),
        created_at: row.try_get("created_at")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.try_get("id")?,
        chat_room_id: row.try_get("chat_room_id")?,
        sender_id: UserId::new(row.try_get::<String, _>("sender_id")?),
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        read: row.try_get("read")?,
    })
}

#[async_trait]
impl ChatStore for Store {
    async fn find_or_create_room(&self, a: &UserId, b: &UserId) -> Result<ChatRoom> {
        let (user_1, user_2) = canonical_pair(a.clone(), b.clone());

        // The unique pair constraint makes concurrent creators converge on one row.
        sqlx::query(
            r#"
            INSERT INTO chat_rooms (id, user_1, user_2, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_1, user_2) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_1.as_str())
        .bind(user_2.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to create chat room")?;

        let row = sqlx::query(
            r#"
            SELECT id, user_1, user_2, created_at, last_message_at
            FROM chat_rooms
            WHERE user_1 = ? AND user_2 = ?
            "#,
        )
        .bind(user_1.as_str())
        .bind(user_2.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to find chat room for {} and {}", user_1, user_2))?;

        room_from_row(&row)
    }

    async fn create_message(
        &self,
        room_id: &str,
        sender: &UserId,
        content: &str,
    ) -> Result<ChatMessage> {
        let mut tx = self.pool.begin().await?;

        let room = sqlx::query("SELECT user_1, user_2 FROM chat_rooms WHERE id = ?")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up chat room")?;
        let Some(room) = room else {
            bail!("chat room {} not found", room_id);
        };
        let user_1: String = room.try_get("user_1")?;
        let user_2: String = room.try_get("user_2")?;
        if sender.as_str() != user_1 && sender.as_str() != user_2 {
            bail!("{} is not a participant of chat room {}", sender, room_id);
        }

        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_room_id: room_id.to_string(),
            sender_id: sender.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
        };

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, chat_room_id, sender_id, content, created_at, read)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.chat_room_id)
        .bind(msg.sender_id.as_str())
        .bind(&msg.content)
        .bind(msg.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to save message")?;

        sqlx::query("UPDATE chat_rooms SET last_message_at = ? WHERE id = ?")
            .bind(msg.created_at)
            .bind(room_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update room activity")?;

        tx.commit().await?;
        Ok(msg)
    }

    async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_room_id, sender_id, content, created_at, read
            FROM chat_messages
            WHERE chat_room_id = ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(room_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        rows.iter().map(message_from_row).collect()
    }

    async fn mark_read(&self, room_id: &str, reader: &UserId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET read = 1
            WHERE chat_room_id = ? AND sender_id != ? AND read = 0
            "#,
        )
        .bind(room_id)
        .bind(reader.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to mark messages as read")?;

        Ok(result.rows_affected())
    }

    async fn is_participant(&self, room_id: &str, user: &UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chat_rooms WHERE id = ? AND (user_1 = ? OR user_2 = ?)")
            .bind(room_id)
            .bind(user.as_str())
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check room membership")?;

        Ok(row.is_some())
    }

    async fn room(&self, room_id: &str) -> Result<Option<ChatRoom>> {
        let row = sqlx::query(
            "SELECT id, user_1, user_2, created_at, last_message_at FROM chat_rooms WHERE id = ?",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chat room")?;

        row.as_ref().map(room_from_row).transpose()
    }

    async fn rooms_for_user(&self, user: &UserId) -> Result<Vec<ChatRoom>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_1, user_2, created_at, last_message_at
            FROM chat_rooms
            WHERE user_1 = ? OR user_2 = ?
            ORDER BY COALESCE(last_message_at, created_at) DESC
            "#,
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat rooms")?;

        rows.iter().map(room_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn room_is_canonical_and_idempotent() {
        let store = store().await;
        let a = UserId::new("alice");
        let b = UserId::new("bob");

        let ab = store.find_or_create_room(&a, &b).await.unwrap();
        let ba = store.find_or_create_room(&b, &a).await.unwrap();
        let again = store.find_or_create_room(&a, &b).await.unwrap();

        assert_eq!(ab.id, ba.id);
        assert_eq!(ab.id, again.id);
        assert_eq!(ab.user_1, a);
        assert_eq!(ab.user_2, b);
        assert!(ab.last_message_at.is_none());
    }

    #[tokio::test]
    async fn messages_list_oldest_first_with_pagination() {
        let store = store().await;
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        let room = store.find_or_create_room(&a, &b).await.unwrap();

        for i in 0..5 {
            store
                .create_message(&room.id, &a, &format!("m{}", i))
                .await
                .unwrap();
        }

        let all = store.list_messages(&room.id, 50, 0).await.unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2", "m3", "m4"]);

        let page = store.list_messages(&room.id, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m2");

        let room = store.room(&room.id).await.unwrap().unwrap();
        assert!(room.last_message_at.is_some());
    }

    #[tokio::test]
    async fn create_message_rejects_outsiders_and_unknown_rooms() {
        let store = store().await;
        let room = store
            .find_or_create_room(&"alice".into(), &"bob".into())
            .await
            .unwrap();

        assert!(store
            .create_message(&room.id, &"mallory".into(), "hi")
            .await
            .is_err());
        assert!(store
            .create_message("no-such-room", &"alice".into(), "hi")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn mark_read_only_touches_other_senders_and_is_idempotent() {
        let store = store().await;
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        let room = store.find_or_create_room(&a, &b).await.unwrap();
        store.create_message(&room.id, &a, "from a").await.unwrap();
        store.create_message(&room.id, &b, "from b 1").await.unwrap();
        store.create_message(&room.id, &b, "from b 2").await.unwrap();

        assert_eq!(store.mark_read(&room.id, &a).await.unwrap(), 2);
        assert_eq!(store.mark_read(&room.id, &a).await.unwrap(), 0);

        for msg in store.list_messages(&room.id, 50, 0).await.unwrap() {
            assert_eq!(msg.read, msg.sender_id == b, "{}", msg.content);
        }
    }

    #[tokio::test]
    async fn participants_and_room_listing() {
        let store = store().await;
        let a = UserId::new("alice");
        let first = store.find_or_create_room(&a, &"bob".into()).await.unwrap();
        let second = store.find_or_create_room(&"carol".into(), &a).await.unwrap();
        store.create_message(&first.id, &a, "hi bob").await.unwrap();

        assert!(store.is_participant(&first.id, &a).await.unwrap());
        assert!(!store.is_participant(&first.id, &"carol".into()).await.unwrap());

        let rooms = store.rooms_for_user(&a).await.unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].id, first.id);
        assert_eq!(rooms[1].id, second.id);
        assert!(store.rooms_for_user(&"dave".into()).await.unwrap().is_empty());
    }
}
