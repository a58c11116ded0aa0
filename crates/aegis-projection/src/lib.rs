#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-projection** – Exactly-once projection engine for Aegis.
//!
//! Projectors derive read models from the event stream. For every
//! `(projector, event)` pair the engine inserts into the applied-events
//! ledger and runs the projector's apply function in the same transaction;
//! if the ledger row already existed the apply is skipped. Replaying the
//! full stream is therefore safe and converges, and any projection can be
//! truncated and rebuilt from sequence 1.
//!
//! Projectors MUST be deterministic functions of `(prior state, event)`:
//! no clocks, no randomness, no out-of-band reads.

use std::sync::Arc;

use anyhow::Result;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use aegis_store_core::EventEnvelope;

pub mod approvals;
pub mod conversations;
pub mod reads;
pub mod runs;

pub use approvals::ApprovalsProjector;
pub use conversations::ConversationProjector;
pub use runs::RunsProjector;

//─────────────────────────────
//  Projector trait
//─────────────────────────────

/// A deterministic read-model builder.
#[async_trait::async_trait]
pub trait Projector: Send + Sync {
    /// Stable name used as the ledger key. Renaming a projector re-applies
    /// the whole stream to it.
    fn name(&self) -> &'static str;

    /// Create this projector's tables if they do not exist.
    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()>;

    /// Apply one event to the read model. Runs inside the engine's
    /// transaction together with the ledger insert.
    async fn apply(&self, conn: &mut SqliteConnection, event: &EventEnvelope) -> Result<()>;

    /// Truncate this projector's tables ahead of a rebuild.
    async fn reset(&self, conn: &mut SqliteConnection) -> Result<()>;
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Drives a set of projectors with exactly-once apply semantics.
pub struct ProjectionEngine {
    pool: SqlitePool,
    projectors: Vec<Arc<dyn Projector>>,
}

impl ProjectionEngine {
    /// Build an engine over `pool`, creating the ledger and every
    /// projector's schema.
    pub async fn new(pool: SqlitePool, projectors: Vec<Arc<dyn Projector>>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projector_applied (
                projector TEXT NOT NULL,
                event_id TEXT NOT NULL,
                PRIMARY KEY (projector, event_id)
            ) STRICT
            "#,
        )
        .execute(&pool)
        .await?;
        for projector in &projectors {
            projector.ensure_schema(&pool).await?;
        }
        Ok(Self { pool, projectors })
    }

    /// The default projector set: conversations, approvals, runs.
    pub fn default_projectors() -> Vec<Arc<dyn Projector>> {
        vec![
            Arc::new(ConversationProjector),
            Arc::new(ApprovalsProjector),
            Arc::new(RunsProjector),
        ]
    }

    /// Apply one committed event to every projector, each in its own
    /// transaction.
    pub async fn apply(&self, event: &EventEnvelope) -> Result<()> {
        for projector in &self.projectors {
            let mut tx = self.pool.begin().await?;
            self.apply_one(&mut tx, projector.as_ref(), event).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Apply one committed event to every projector on a caller-owned
    /// transaction, so read-model updates can commit atomically with the
    /// append that produced the event.
    pub async fn apply_in_tx(
        &self,
        conn: &mut SqliteConnection,
        event: &EventEnvelope,
    ) -> Result<()> {
        for projector in &self.projectors {
            self.apply_one(conn, projector.as_ref(), event).await?;
        }
        Ok(())
    }

    async fn apply_one(
        &self,
        conn: &mut SqliteConnection,
        projector: &dyn Projector,
        event: &EventEnvelope,
    ) -> Result<()> {
        let marked = sqlx::query(
            "INSERT INTO projector_applied (projector, event_id) VALUES (?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(projector.name())
        .bind(event.event_id.to_string())
        .execute(&mut *conn)
        .await?;
        if marked.rows_affected() == 0 {
            debug!(
                projector = projector.name(),
                event_id = %event.event_id,
                "event already applied, skipping"
            );
            return Ok(());
        }
        projector.apply(conn, event).await
    }

    /// Truncate every projection and replay `events` (full streams in
    /// ascending sequence order) from scratch.
    pub async fn rebuild_from(&self, events: &[EventEnvelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM projector_applied")
            .execute(&mut *tx)
            .await?;
        for projector in &self.projectors {
            projector.reset(&mut tx).await?;
        }
        for event in events {
            self.apply_in_tx(&mut tx, event).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// How many times `projector` has applied `event_id` (0 or 1).
    pub async fn applied_count(&self, projector: &str, event_id: uuid::Uuid) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM projector_applied WHERE projector = ? AND event_id = ?",
        )
        .bind(projector)
        .bind(event_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    /// The pool the read models live on.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_store_core::{EventStore, NewEvent};
    use aegis_store_sqlite::SqliteEventStore;
    use aegis_types::{ActorRef, ApprovalStatus, EventData, RunStatus, StreamRef};
    use uuid::Uuid;

    async fn engine_over(store: &SqliteEventStore) -> ProjectionEngine {
        ProjectionEngine::new(store.pool().clone(), ProjectionEngine::default_projectors())
            .await
            .unwrap()
    }

    fn run_created(stream: StreamRef, run_id: Uuid) -> NewEvent {
        let data = EventData::RunCreated { run_id, goal: "do the thing".into() };
        NewEvent::new(data.event_type(), stream, ActorRef::user("alice").unwrap(), data.to_value())
            .for_run(run_id)
    }

    #[tokio::test]
    async fn events_apply_exactly_once() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let engine = engine_over(&store).await;
        let stream = StreamRef::room(Uuid::new_v4());
        let run_id = Uuid::new_v4();

        let receipt = store.append(run_created(stream, run_id)).await.unwrap();
        engine.apply(&receipt.event).await.unwrap();
        engine.apply(&receipt.event).await.unwrap(); // second apply is a no-op

        assert_eq!(engine.applied_count("runs", receipt.event.event_id).await.unwrap(), 1);
        let run = reads::run_by_id(engine.pool(), run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.goal, "do the thing");
    }

    #[tokio::test]
    async fn approval_projector_rejects_double_decisions() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let engine = engine_over(&store).await;
        let workspace = Uuid::new_v4();
        let stream = StreamRef::workspace(workspace);
        let approval_id = Uuid::new_v4();

        let request = EventData::ApprovalRequested {
            approval_id,
            action: "external.write".into(),
            scope: aegis_types::ApprovalScope::Workspace,
            context: None,
        };
        let receipt = store
            .append(
                NewEvent::new(
                    request.event_type(),
                    stream,
                    ActorRef::agent("requester").unwrap(),
                    request.to_value(),
                )
                .in_workspace(workspace),
            )
            .await
            .unwrap();
        engine.apply(&receipt.event).await.unwrap();

        for (decider, outcome) in
            [("carol", ApprovalStatus::Approved), ("dave", ApprovalStatus::Denied)]
        {
            let decision = EventData::ApprovalDecided {
                approval_id,
                outcome,
                comment: None,
                expires_at: None,
            };
            let receipt = store
                .append(
                    NewEvent::new(
                        decision.event_type(),
                        stream,
                        ActorRef::user(decider).unwrap(),
                        decision.to_value(),
                    )
                    .in_workspace(workspace),
                )
                .await
                .unwrap();
            engine.apply(&receipt.event).await.unwrap();
        }

        // The first sequenced decision won; the second was skipped.
        let approval = reads::approval_by_id(engine.pool(), approval_id).await.unwrap().unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.decided_by.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn rebuild_converges_with_incremental_state() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let engine = engine_over(&store).await;
        let room = Uuid::new_v4();
        let stream = StreamRef::room(room);
        let run_id = Uuid::new_v4();

        let events = vec![
            {
                let data = EventData::RoomCreated { room_id: room, name: "ops".into() };
                NewEvent::new(data.event_type(), stream, ActorRef::user("alice").unwrap(), data.to_value())
                    .in_room(room)
            },
            run_created(stream, run_id).in_room(room),
            {
                let data = EventData::StepAdded {
                    run_id,
                    step_id: Uuid::new_v4(),
                    title: "fetch inputs".into(),
                };
                NewEvent::new(data.event_type(), stream, ActorRef::agent("worker").unwrap(), data.to_value())
                    .for_run(run_id)
            },
        ];
        for event in events {
            let receipt = store.append(event).await.unwrap();
            engine.apply(&receipt.event).await.unwrap();
        }

        let incremental = reads::run_by_id(engine.pool(), run_id).await.unwrap().unwrap();

        let full_stream = store.read_stream(stream, 0, None).await.unwrap();
        engine.rebuild_from(&full_stream).await.unwrap();

        let rebuilt = reads::run_by_id(engine.pool(), run_id).await.unwrap().unwrap();
        assert_eq!(rebuilt.status, incremental.status);
        assert_eq!(rebuilt.goal, incremental.goal);
        assert_eq!(rebuilt.correlation_id, incremental.correlation_id);
        assert_eq!(
            reads::steps_for_run(engine.pool(), run_id).await.unwrap().len(),
            1
        );
        assert_eq!(reads::list_rooms(engine.pool()).await.unwrap().len(), 1);
    }
}
