//! Approvals projector: the `pending → {approved, denied, held}` machine.
//!
//! Decision races are linearized by append order: the first
//! `approval.decided` to be sequenced wins, and any later decision fails the
//! transition check here and is skipped. Callers detect the loss by reading
//! the projection's `decision_event_id` after apply.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::warn;

use aegis_store_core::canonical::canonical_timestamp;
use aegis_store_core::EventEnvelope;
use aegis_types::{ApprovalStatus, EventData};

use crate::Projector;

/// Projects `approval.requested` and `approval.decided` into the approvals
/// read model.
pub struct ApprovalsProjector;

#[async_trait::async_trait]
impl Projector for ApprovalsProjector {
    fn name(&self) -> &'static str {
        "approvals"
    }

    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS approvals (
                approval_id TEXT PRIMARY KEY,
                workspace_id TEXT,
                room_id TEXT,
                action TEXT NOT NULL,
                scope_json TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                requested_at TEXT NOT NULL,
                decided_by TEXT,
                decided_at TEXT,
                expires_at TEXT,
                comment TEXT,
                decision_event_id TEXT
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_approvals_lookup \
             ON approvals (workspace_id, action, status)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, conn: &mut SqliteConnection, event: &EventEnvelope) -> Result<()> {
        let Ok(data) = EventData::parse(&event.event_type, &event.data) else {
            return Ok(());
        };
        match data {
            EventData::ApprovalRequested { approval_id, action, scope, .. } => {
                sqlx::query(
                    "INSERT INTO approvals (approval_id, workspace_id, room_id, action, \
                     scope_json, status, requested_by, requested_at) \
                     VALUES (?, ?, ?, ?, ?, 'pending', ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(approval_id.to_string())
                .bind(event.workspace_id.map(|id| id.to_string()))
                .bind(event.room_id.map(|id| id.to_string()))
                .bind(action)
                .bind(serde_json::to_string(&scope)?)
                .bind(&event.actor.id)
                .bind(canonical_timestamp(&event.occurred_at))
                .execute(conn)
                .await?;
            }
            EventData::ApprovalDecided { approval_id, outcome, comment, expires_at } => {
                let row = sqlx::query("SELECT status FROM approvals WHERE approval_id = ?")
                    .bind(approval_id.to_string())
                    .fetch_optional(&mut *conn)
                    .await?;
                let Some(row) = row else {
                    warn!(%approval_id, "decision for unknown approval, skipping");
                    return Ok(());
                };
                let current = ApprovalStatus::parse(&row.get::<String, _>("status"))
                    .unwrap_or(ApprovalStatus::Pending);
                if !current.can_transition_to(outcome) {
                    // A prior decision already won the race.
                    warn!(
                        %approval_id,
                        current = current.as_str(),
                        attempted = outcome.as_str(),
                        "invalid approval transition, skipping"
                    );
                    return Ok(());
                }
                sqlx::query(
                    "UPDATE approvals SET status = ?, decided_by = ?, decided_at = ?, \
                     expires_at = ?, comment = ?, decision_event_id = ? WHERE approval_id = ?",
                )
                .bind(outcome.as_str())
                .bind(&event.actor.id)
                .bind(canonical_timestamp(&event.occurred_at))
                .bind(expires_at.map(|ts| canonical_timestamp(&ts)))
                .bind(comment)
                .bind(event.event_id.to_string())
                .bind(approval_id.to_string())
                .execute(conn)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("DELETE FROM approvals").execute(conn).await?;
        Ok(())
    }
}
