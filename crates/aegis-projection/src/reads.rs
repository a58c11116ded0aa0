//! Typed read access to the projection tables.
//!
//! These are the rows the kernel and the HTTP surface consume. They are
//! plain queries over the projector-owned tables; nothing here writes.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use aegis_types::{ApprovalScope, ApprovalStatus, RunStatus};

//─────────────────────────────
//  Approvals
//─────────────────────────────

/// One row of the approvals read model.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRow {
    /// The approval's id.
    pub approval_id: Uuid,
    /// Workspace the approval belongs to.
    pub workspace_id: Option<Uuid>,
    /// Room the request originated from.
    pub room_id: Option<Uuid>,
    /// The action the approval covers.
    pub action: String,
    /// The domain the approval covers.
    pub scope: ApprovalScope,
    /// Current status.
    pub status: ApprovalStatus,
    /// Who asked.
    pub requested_by: String,
    /// When they asked.
    pub requested_at: DateTime<Utc>,
    /// Who decided, once decided.
    pub decided_by: Option<String>,
    /// When it was decided.
    pub decided_at: Option<DateTime<Utc>>,
    /// When an approved grant stops matching.
    pub expires_at: Option<DateTime<Utc>>,
    /// Decider comment.
    pub comment: Option<String>,
    /// The event that decided this approval; used to resolve decision races.
    pub decision_event_id: Option<Uuid>,
}

/// Fetch one approval by id.
pub async fn approval_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<ApprovalRow>> {
    let row = sqlx::query("SELECT * FROM approvals WHERE approval_id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(approval_from_row).transpose()
}

/// List approvals, newest first, optionally filtered.
pub async fn list_approvals(
    pool: &SqlitePool,
    workspace_id: Option<Uuid>,
    status: Option<ApprovalStatus>,
) -> Result<Vec<ApprovalRow>> {
    let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT * FROM approvals WHERE 1=1");
    if let Some(workspace_id) = workspace_id {
        builder.push(" AND workspace_id = ").push_bind(workspace_id.to_string());
    }
    if let Some(status) = status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    builder.push(" ORDER BY requested_at DESC");
    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(approval_from_row).collect()
}

/// Active (approved, unexpired) approvals for `(workspace, action)`.
pub async fn active_approvals(
    pool: &SqlitePool,
    workspace_id: Uuid,
    action: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ApprovalRow>> {
    let rows = sqlx::query(
        "SELECT * FROM approvals \
         WHERE workspace_id = ? AND action = ? AND status = 'approved' \
         AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(workspace_id.to_string())
    .bind(action)
    .bind(aegis_store_core::canonical::canonical_timestamp(&now))
    .fetch_all(pool)
    .await?;
    rows.iter().map(approval_from_row).collect()
}

fn approval_from_row(row: &SqliteRow) -> Result<ApprovalRow> {
    Ok(ApprovalRow {
        approval_id: parse_uuid(&row.get::<String, _>("approval_id"))?,
        workspace_id: parse_opt_uuid(row.get("workspace_id"))?,
        room_id: parse_opt_uuid(row.get("room_id"))?,
        action: row.get("action"),
        scope: serde_json::from_str(&row.get::<String, _>("scope_json"))?,
        status: ApprovalStatus::parse(&row.get::<String, _>("status"))
            .ok_or_else(|| anyhow!("unknown approval status"))?,
        requested_by: row.get("requested_by"),
        requested_at: parse_ts(&row.get::<String, _>("requested_at"))?,
        decided_by: row.get("decided_by"),
        decided_at: parse_opt_ts(row.get("decided_at"))?,
        expires_at: parse_opt_ts(row.get("expires_at"))?,
        comment: row.get("comment"),
        decision_event_id: parse_opt_uuid(row.get("decision_event_id"))?,
    })
}

//─────────────────────────────
//  Runs
//─────────────────────────────

/// One row of the runs read model, claim fields included.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    /// The run's id.
    pub run_id: Uuid,
    /// Workspace the run belongs to.
    pub workspace_id: Option<Uuid>,
    /// Room the run belongs to.
    pub room_id: Option<Uuid>,
    /// What the run is trying to accomplish.
    pub goal: String,
    /// Current status.
    pub status: RunStatus,
    /// Correlation id shared by all the run's events.
    pub correlation_id: Uuid,
    /// Live lease handle, if claimed.
    pub claim_token: Option<String>,
    /// Who holds the claim.
    pub claimed_by_actor_id: Option<String>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the lease lapses unless renewed.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last successful heartbeat.
    pub lease_heartbeat_at: Option<DateTime<Utc>>,
    /// Evidence bundle reference, once terminal.
    pub evidence_ref: Option<String>,
    /// Failure description for failed runs.
    pub error: Option<String>,
    /// Last event applied to this row.
    pub last_event_id: Option<Uuid>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
}

impl RunRow {
    /// Whether the run currently holds a live (unexpired) claim.
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claim_token.is_some()
            && self.lease_expires_at.map(|exp| exp > now).unwrap_or(false)
    }
}

/// Fetch one run by id.
pub async fn run_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<RunRow>> {
    let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

/// List runs, newest first, optionally filtered.
pub async fn list_runs(
    pool: &SqlitePool,
    workspace_id: Option<Uuid>,
    status: Option<RunStatus>,
    limit: Option<u64>,
) -> Result<Vec<RunRow>> {
    let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT * FROM runs WHERE 1=1");
    if let Some(workspace_id) = workspace_id {
        builder.push(" AND workspace_id = ").push_bind(workspace_id.to_string());
    }
    if let Some(status) = status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    builder.push(" ORDER BY created_at DESC");
    if let Some(limit) = limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }
    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(run_from_row).collect()
}

/// Steps recorded under a run, oldest first.
pub async fn steps_for_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<StepRow>> {
    let rows = sqlx::query("SELECT * FROM run_steps WHERE run_id = ? ORDER BY added_at ASC")
        .bind(run_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(StepRow {
                step_id: parse_uuid(&row.get::<String, _>("step_id"))?,
                run_id: parse_uuid(&row.get::<String, _>("run_id"))?,
                title: row.get("title"),
                correlation_id: parse_uuid(&row.get::<String, _>("correlation_id"))?,
                added_at: parse_ts(&row.get::<String, _>("added_at"))?,
            })
        })
        .collect()
}

/// One step attached to a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepRow {
    /// The step's id.
    pub step_id: Uuid,
    /// The parent run.
    pub run_id: Uuid,
    /// What the step does.
    pub title: String,
    /// Correlation id inherited from the run.
    pub correlation_id: Uuid,
    /// When the step was recorded.
    pub added_at: DateTime<Utc>,
}

fn run_from_row(row: &SqliteRow) -> Result<RunRow> {
    Ok(RunRow {
        run_id: parse_uuid(&row.get::<String, _>("run_id"))?,
        workspace_id: parse_opt_uuid(row.get("workspace_id"))?,
        room_id: parse_opt_uuid(row.get("room_id"))?,
        goal: row.get("goal"),
        status: RunStatus::parse(&row.get::<String, _>("status"))
            .ok_or_else(|| anyhow!("unknown run status"))?,
        correlation_id: parse_uuid(&row.get::<String, _>("correlation_id"))?,
        claim_token: row.get("claim_token"),
        claimed_by_actor_id: row.get("claimed_by_actor_id"),
        claimed_at: parse_opt_ts(row.get("claimed_at"))?,
        lease_expires_at: parse_opt_ts(row.get("lease_expires_at"))?,
        lease_heartbeat_at: parse_opt_ts(row.get("lease_heartbeat_at"))?,
        evidence_ref: row.get("evidence_ref"),
        error: row.get("error"),
        last_event_id: parse_opt_uuid(row.get("last_event_id"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

//─────────────────────────────
//  Conversations
//─────────────────────────────

/// One room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomRow {
    /// The room's id.
    pub room_id: Uuid,
    /// Workspace the room belongs to.
    pub workspace_id: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// When the room was created.
    pub created_at: DateTime<Utc>,
}

/// One message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    /// The message's id.
    pub message_id: Uuid,
    /// The thread the message belongs to.
    pub thread_id: Uuid,
    /// Author kind (`user`, `agent`, `service`).
    pub author_kind: String,
    /// Author id.
    pub author_id: String,
    /// Message body.
    pub body: String,
    /// When the message was posted.
    pub posted_at: DateTime<Utc>,
}

/// List every room, oldest first.
pub async fn list_rooms(pool: &SqlitePool) -> Result<Vec<RoomRow>> {
    let rows = sqlx::query("SELECT * FROM rooms ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(RoomRow {
                room_id: parse_uuid(&row.get::<String, _>("room_id"))?,
                workspace_id: parse_opt_uuid(row.get("workspace_id"))?,
                name: row.get("name"),
                created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            })
        })
        .collect()
}

/// Messages in a thread, oldest first.
pub async fn messages_for_thread(pool: &SqlitePool, thread_id: Uuid) -> Result<Vec<MessageRow>> {
    let rows = sqlx::query("SELECT * FROM messages WHERE thread_id = ? ORDER BY posted_at ASC")
        .bind(thread_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(MessageRow {
                message_id: parse_uuid(&row.get::<String, _>("message_id"))?,
                thread_id: parse_uuid(&row.get::<String, _>("thread_id"))?,
                author_kind: row.get("author_kind"),
                author_id: row.get("author_id"),
                body: row.get("body"),
                posted_at: parse_ts(&row.get::<String, _>("posted_at"))?,
            })
        })
        .collect()
}

//─────────────────────────────
//  Parsing helpers
//─────────────────────────────

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| anyhow!("corrupt uuid {raw}: {e}"))
}

fn parse_opt_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| anyhow!("corrupt timestamp {raw}: {e}"))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}
