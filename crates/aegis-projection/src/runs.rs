//! Runs projector: run lifecycle, steps, tool calls, artifacts.
//!
//! Status transitions are enforced with guarded UPDATEs so replay is
//! deterministic: an event that would violate the machine simply matches
//! zero rows. Terminal events clear the claim columns, preserving the
//! invariant that a claim exists only on a live, leased run.

use anyhow::Result;
use sqlx::{SqliteConnection, SqlitePool};

use aegis_store_core::canonical::canonical_timestamp;
use aegis_store_core::EventEnvelope;
use aegis_types::EventData;

use crate::Projector;

/// Projects the `run.*` event family into the runs read model.
pub struct RunsProjector;

#[async_trait::async_trait]
impl Projector for RunsProjector {
    fn name(&self) -> &'static str {
        "runs"
    }

    async fn ensure_schema(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                workspace_id TEXT,
                room_id TEXT,
                goal TEXT NOT NULL,
                status TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                claim_token TEXT,
                claimed_by_actor_id TEXT,
                claimed_at TEXT,
                lease_expires_at TEXT,
                lease_heartbeat_at TEXT,
                evidence_ref TEXT,
                error TEXT,
                last_event_id TEXT,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runs_claimable \
             ON runs (status, lease_expires_at, created_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_steps (
                step_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                title TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                added_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_calls (
                tool_call_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT,
                tool_name TEXT NOT NULL,
                request TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                called_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                artifact_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT,
                kind TEXT NOT NULL,
                uri TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                added_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, conn: &mut SqliteConnection, event: &EventEnvelope) -> Result<()> {
        let Ok(data) = EventData::parse(&event.event_type, &event.data) else {
            return Ok(());
        };
        let event_id = event.event_id.to_string();
        let at = canonical_timestamp(&event.occurred_at);
        match data {
            EventData::RunCreated { run_id, goal } => {
                sqlx::query(
                    "INSERT INTO runs (run_id, workspace_id, room_id, goal, status, \
                     correlation_id, last_event_id, created_at) \
                     VALUES (?, ?, ?, ?, 'queued', ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(run_id.to_string())
                .bind(event.workspace_id.map(|id| id.to_string()))
                .bind(event.room_id.map(|id| id.to_string()))
                .bind(goal)
                .bind(event.correlation_id.to_string())
                .bind(&event_id)
                .bind(&at)
                .execute(conn)
                .await?;
            }
            EventData::RunClaimed {
                run_id,
                claim_token,
                claimed_by_actor_id,
                lease_expires_at,
            } => {
                sqlx::query(
                    "UPDATE runs SET claim_token = ?, claimed_by_actor_id = ?, \
                     claimed_at = ?, lease_expires_at = ?, lease_heartbeat_at = ?, \
                     last_event_id = ? \
                     WHERE run_id = ? AND status IN ('queued', 'running')",
                )
                .bind(claim_token)
                .bind(claimed_by_actor_id)
                .bind(&at)
                .bind(canonical_timestamp(&lease_expires_at))
                .bind(&at)
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            EventData::RunStarted { run_id } => {
                sqlx::query(
                    "UPDATE runs SET status = 'running', last_event_id = ? \
                     WHERE run_id = ? AND status = 'queued'",
                )
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            EventData::StepAdded { run_id, step_id, title } => {
                sqlx::query(
                    "INSERT INTO run_steps (step_id, run_id, title, correlation_id, added_at) \
                     VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(step_id.to_string())
                .bind(run_id.to_string())
                .bind(title)
                .bind(event.correlation_id.to_string())
                .bind(&at)
                .execute(conn)
                .await?;
            }
            EventData::ToolCalled { run_id, tool_call_id, step_id, tool_name, request } => {
                sqlx::query(
                    "INSERT INTO tool_calls (tool_call_id, run_id, step_id, tool_name, \
                     request, correlation_id, called_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(tool_call_id.to_string())
                .bind(run_id.to_string())
                .bind(step_id.map(|id| id.to_string()))
                .bind(tool_name)
                .bind(request.to_string())
                .bind(event.correlation_id.to_string())
                .bind(&at)
                .execute(conn)
                .await?;
            }
            EventData::ArtifactAdded { run_id, artifact_id, step_id, kind, uri } => {
                sqlx::query(
                    "INSERT INTO artifacts (artifact_id, run_id, step_id, kind, uri, \
                     correlation_id, added_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(artifact_id.to_string())
                .bind(run_id.to_string())
                .bind(step_id.map(|id| id.to_string()))
                .bind(kind)
                .bind(uri)
                .bind(event.correlation_id.to_string())
                .bind(&at)
                .execute(conn)
                .await?;
            }
            EventData::RunCompleted { run_id, evidence_ref } => {
                sqlx::query(
                    "UPDATE runs SET status = 'succeeded', evidence_ref = ?, \
                     claim_token = NULL, claimed_by_actor_id = NULL, claimed_at = NULL, \
                     lease_expires_at = NULL, lease_heartbeat_at = NULL, last_event_id = ? \
                     WHERE run_id = ? AND status = 'running'",
                )
                .bind(evidence_ref)
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            EventData::RunFailed { run_id, error, evidence_ref } => {
                sqlx::query(
                    "UPDATE runs SET status = 'failed', evidence_ref = ?, error = ?, \
                     claim_token = NULL, claimed_by_actor_id = NULL, claimed_at = NULL, \
                     lease_expires_at = NULL, lease_heartbeat_at = NULL, last_event_id = ? \
                     WHERE run_id = ? AND status = 'running'",
                )
                .bind(evidence_ref)
                .bind(error)
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            EventData::RunCancelled { run_id, .. } => {
                sqlx::query(
                    "UPDATE runs SET status = 'cancelled', \
                     claim_token = NULL, claimed_by_actor_id = NULL, claimed_at = NULL, \
                     lease_expires_at = NULL, lease_heartbeat_at = NULL, last_event_id = ? \
                     WHERE run_id = ? AND status IN ('queued', 'running')",
                )
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            EventData::RunTimedOut { run_id } => {
                sqlx::query(
                    "UPDATE runs SET status = 'timed_out', \
                     claim_token = NULL, claimed_by_actor_id = NULL, claimed_at = NULL, \
                     lease_expires_at = NULL, lease_heartbeat_at = NULL, last_event_id = ? \
                     WHERE run_id = ? AND status = 'running'",
                )
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            EventData::RunLeaseExpired { run_id, .. } | EventData::RunReleased { run_id } => {
                sqlx::query(
                    "UPDATE runs SET status = 'queued', \
                     claim_token = NULL, claimed_by_actor_id = NULL, claimed_at = NULL, \
                     lease_expires_at = NULL, lease_heartbeat_at = NULL, last_event_id = ? \
                     WHERE run_id = ? AND status IN ('queued', 'running')",
                )
                .bind(&event_id)
                .bind(run_id.to_string())
                .execute(conn)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reset(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("DELETE FROM artifacts").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM tool_calls").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM run_steps").execute(&mut *conn).await?;
        sqlx::query("DELETE FROM runs").execute(&mut *conn).await?;
        Ok(())
    }
}
