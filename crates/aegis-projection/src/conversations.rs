//! Conversational surface projector: rooms, threads, messages.

use anyhow::Result;
use sqlx::{SqliteConnection, SqlitePool};

use aegis_store_core::canonical::canonical_timestamp;
use aegis_store_core::EventEnvelope;
use aegis_types::EventData;

use crate::Projector;

/// Projects `room.created`, `thread.created`, and `message.posted` into the
/// conversational read model.
pub struct ConversationProjector;

#[async_trait::async_trait]
impl Projector for ConversationProjector {
    fn name(&self) -> &'static str {
        "conversations"
    }

    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                workspace_id TEXT,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                author_kind TEXT NOT NULL,
                author_id TEXT NOT NULL,
                body TEXT NOT NULL,
                posted_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages (thread_id)")
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn apply(&self, conn: &mut SqliteConnection, event: &EventEnvelope) -> Result<()> {
        let Ok(data) = EventData::parse(&event.event_type, &event.data) else {
            // Not a payload this projector understands; other event types
            // flow through the same engine.
            return Ok(());
        };
        match data {
            EventData::RoomCreated { room_id, name } => {
                sqlx::query(
                    "INSERT INTO rooms (room_id, workspace_id, name, created_at) \
                     VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(room_id.to_string())
                .bind(event.workspace_id.map(|id| id.to_string()))
                .bind(name)
                .bind(canonical_timestamp(&event.occurred_at))
                .execute(conn)
                .await?;
            }
            EventData::ThreadCreated { thread_id, room_id, title } => {
                sqlx::query(
                    "INSERT INTO threads (thread_id, room_id, title, created_at) \
                     VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(thread_id.to_string())
                .bind(room_id.to_string())
                .bind(title)
                .bind(canonical_timestamp(&event.occurred_at))
                .execute(conn)
                .await?;
            }
            EventData::MessagePosted { message_id, thread_id, body } => {
                sqlx::query(
                    "INSERT INTO messages \
                     (message_id, thread_id, author_kind, author_id, body, posted_at) \
                     VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(message_id.to_string())
                .bind(thread_id.to_string())
                .bind(event.actor.kind.as_str())
                .bind(&event.actor.id)
                .bind(body)
                .bind(canonical_timestamp(&event.occurred_at))
                .execute(conn)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("DELETE FROM messages").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM threads").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM rooms").execute(&mut *conn).await?;
        Ok(())
    }
}
