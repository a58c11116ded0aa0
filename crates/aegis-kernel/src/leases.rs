//! The claim-lease coordinator.
//!
//! External worker processes share queued work without a coordinator
//! service: claims, heartbeats, releases, and the expiry sweep all go
//! through guarded updates on the shared backend. Each claim is a per-run
//! UPDATE re-checking `claim_token IS NULL OR lease_expires_at < now`
//! inside one transaction, so racing claimers cannot both win. On SQLite
//! the single-writer transaction serializes them; on MVCC backends the
//! same statement is to be paired with `FOR UPDATE SKIP LOCKED`.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::Row;
use uuid::Uuid;

use aegis_store_core::canonical::{canonical_timestamp, truncate_to_millis};
use aegis_store_core::NewEvent;
use aegis_types::{ActorRef, EventData, RunStatus};

use crate::runs::run_stream;
use crate::{Kernel, KernelError};

/// One successful claim handed back to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    /// The claimed run.
    pub run_id: Uuid,
    /// The lease handle; required for every later operation on the run.
    pub claim_token: String,
    /// When the lease lapses unless renewed.
    pub lease_expires_at: DateTime<Utc>,
}

/// The result of a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    /// The lease was extended.
    Renewed {
        /// The new expiry.
        lease_expires_at: DateTime<Utc>,
    },
    /// The heartbeat arrived faster than the minimum interval; the lease is
    /// unchanged. Not an error.
    Throttled {
        /// The unchanged expiry.
        lease_expires_at: DateTime<Utc>,
    },
}

/// How a worker hands a run back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// Return the run to the queue for someone else.
    Released,
    /// The run finished successfully; `run.completed` must already be
    /// appended.
    Completed,
    /// The run finished unsuccessfully; `run.failed` must already be
    /// appended.
    Failed,
}

fn new_claim_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Kernel {
    /// Claim up to `batch_limit` runs for `actor_id`.
    ///
    /// Eligible runs are queued with no claim, or claimed with an expired
    /// lease (stale reclamation), ordered oldest-lease-first then
    /// oldest-created-first. Each claim appends a `run.claimed` event in
    /// the same transaction.
    pub async fn claim_runs(
        &self,
        workspace_id: Option<Uuid>,
        actor_id: &str,
        batch_limit: usize,
    ) -> Result<Vec<ClaimedRun>, KernelError> {
        let now = truncate_to_millis(Utc::now());
        let now_str = canonical_timestamp(&now);
        let lease_expires_at = truncate_to_millis(now + chrono_duration(self.config().lease_duration));

        let mut tx = self.pool().begin().await?;

        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT run_id, workspace_id, room_id, correlation_id FROM runs \
             WHERE ((status = 'queued' AND claim_token IS NULL) \
             OR (claim_token IS NOT NULL AND lease_expires_at < ",
        );
        builder.push_bind(&now_str);
        builder.push(" AND status IN ('queued', 'running')))");
        if let Some(workspace_id) = workspace_id {
            builder.push(" AND workspace_id = ").push_bind(workspace_id.to_string());
        }
        builder.push(" ORDER BY lease_expires_at ASC NULLS FIRST, created_at ASC LIMIT ");
        builder.push_bind(batch_limit as i64);
        let candidates = builder.build().fetch_all(&mut *tx).await?;

        let mut claimed = Vec::new();
        let mut committed = Vec::new();
        for row in candidates {
            let run_id = Uuid::parse_str(&row.get::<String, _>("run_id"))
                .map_err(|e| KernelError::Internal(anyhow::Error::new(e)))?;
            let claim_token = new_claim_token();

            // Guarded per-run claim: the precondition is re-checked so a
            // racing claimer matches zero rows.
            let updated = sqlx::query(
                "UPDATE runs SET claim_token = ?, claimed_by_actor_id = ?, claimed_at = ?, \
                 lease_expires_at = ?, lease_heartbeat_at = ? \
                 WHERE run_id = ? AND status IN ('queued', 'running') \
                 AND (claim_token IS NULL OR lease_expires_at < ?)",
            )
            .bind(&claim_token)
            .bind(actor_id)
            .bind(&now_str)
            .bind(canonical_timestamp(&lease_expires_at))
            .bind(&now_str)
            .bind(run_id.to_string())
            .bind(&now_str)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                continue;
            }

            let data = EventData::RunClaimed {
                run_id,
                claim_token: claim_token.clone(),
                claimed_by_actor_id: actor_id.to_string(),
                lease_expires_at,
            };
            let run_workspace =
                parse_opt_uuid(row.get::<Option<String>, _>("workspace_id"))?;
            let run_room = parse_opt_uuid(row.get::<Option<String>, _>("room_id"))?;
            let correlation_id = Uuid::parse_str(&row.get::<String, _>("correlation_id"))
                .map_err(|e| KernelError::Internal(anyhow::Error::new(e)))?;

            let mut event = NewEvent::new(
                data.event_type(),
                run_stream(run_workspace.unwrap_or_else(Uuid::nil), run_room),
                ActorRef::service(actor_id).map_err(KernelError::Malformed)?,
                data.to_value(),
            )
            .for_run(run_id)
            .correlate(correlation_id);
            event.workspace_id = run_workspace;
            event.room_id = run_room;
            event.occurred_at = now;

            let (_, events) = self.store().append_in_tx(&mut tx, &event).await?;
            for event in &events {
                self.projections()
                    .apply_in_tx(&mut tx, event)
                    .await
                    .map_err(KernelError::Internal)?;
            }
            committed.extend(events);

            claimed.push(ClaimedRun { run_id, claim_token, lease_expires_at });
        }

        tx.commit().await?;
        self.store().notify(&committed);
        Ok(claimed)
    }

    /// Renew a lease. Heartbeats faster than the minimum interval are
    /// throttled without error; everything else that does not match a live
    /// claim is `lease_lost`.
    pub async fn heartbeat(
        &self,
        run_id: Uuid,
        claim_token: &str,
    ) -> Result<HeartbeatOutcome, KernelError> {
        let run = self.load_run(run_id).await?;
        let now = truncate_to_millis(Utc::now());

        if run.status.is_terminal()
            || run.claim_token.as_deref() != Some(claim_token)
            || !run.has_live_claim(now)
        {
            return Err(KernelError::LeaseLost);
        }
        // Past the maximum claim age the lease is no longer renewable; the
        // sweeper will reclaim the run.
        if let Some(claimed_at) = run.claimed_at {
            if now - claimed_at >= chrono_duration(self.config().max_claim_age) {
                return Err(KernelError::LeaseLost);
            }
        }
        if let Some(last_beat) = run.lease_heartbeat_at {
            if now - last_beat < chrono_duration(self.config().heartbeat_min_interval) {
                return Ok(HeartbeatOutcome::Throttled {
                    lease_expires_at: run.lease_expires_at.unwrap_or(now),
                });
            }
        }

        let lease_expires_at = truncate_to_millis(now + chrono_duration(self.config().lease_duration));
        let updated = sqlx::query(
            "UPDATE runs SET lease_expires_at = ?, lease_heartbeat_at = ? \
             WHERE run_id = ? AND claim_token = ? AND lease_expires_at > ?",
        )
        .bind(canonical_timestamp(&lease_expires_at))
        .bind(canonical_timestamp(&now))
        .bind(run_id.to_string())
        .bind(claim_token)
        .bind(canonical_timestamp(&now))
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(KernelError::LeaseLost);
        }
        Ok(HeartbeatOutcome::Renewed { lease_expires_at })
    }

    /// Hand a run back, voluntarily or after a terminal outcome.
    pub async fn release_run(
        &self,
        run_id: Uuid,
        claim_token: &str,
        final_state: ReleaseState,
        actor: ActorRef,
    ) -> Result<(), KernelError> {
        let run = self.load_run(run_id).await?;
        match final_state {
            ReleaseState::Released => {
                self.verify_claim(&run, &actor, claim_token)?;
                let data = EventData::RunReleased { run_id };
                let mut event = NewEvent::new(
                    data.event_type(),
                    run_stream(run.workspace_id.unwrap_or_else(Uuid::nil), run.room_id),
                    actor,
                    data.to_value(),
                )
                .for_run(run_id)
                .correlate(run.correlation_id);
                event.workspace_id = run.workspace_id;
                event.room_id = run.room_id;
                event.causation_id = run.last_event_id;
                self.commit_event(event).await?;
                Ok(())
            }
            ReleaseState::Completed => release_terminal(&run, RunStatus::Succeeded),
            ReleaseState::Failed => release_terminal(&run, RunStatus::Failed),
        }
    }

    /// Reclaim every run whose lease expired or whose claim outlived
    /// `max_claim_age`. Returns the reclaimed run ids.
    pub async fn sweep_expired_leases(&self) -> Result<Vec<Uuid>, KernelError> {
        let now = truncate_to_millis(Utc::now());
        let now_str = canonical_timestamp(&now);
        let age_cutoff =
            canonical_timestamp(&(now - chrono_duration(self.config().max_claim_age)));

        let mut tx = self.pool().begin().await?;
        let stale = sqlx::query(
            "SELECT run_id, workspace_id, room_id, correlation_id, claimed_by_actor_id \
             FROM runs WHERE claim_token IS NOT NULL AND status IN ('queued', 'running') \
             AND (lease_expires_at <= ? OR claimed_at <= ?)",
        )
        .bind(&now_str)
        .bind(&age_cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::new();
        let mut committed = Vec::new();
        for row in stale {
            let run_id = Uuid::parse_str(&row.get::<String, _>("run_id"))
                .map_err(|e| KernelError::Internal(anyhow::Error::new(e)))?;
            let claimed_by: Option<String> = row.get("claimed_by_actor_id");
            let data = EventData::RunLeaseExpired {
                run_id,
                claimed_by_actor_id: claimed_by.unwrap_or_default(),
            };
            let run_workspace =
                parse_opt_uuid(row.get::<Option<String>, _>("workspace_id"))?;
            let run_room = parse_opt_uuid(row.get::<Option<String>, _>("room_id"))?;
            let correlation_id = Uuid::parse_str(&row.get::<String, _>("correlation_id"))
                .map_err(|e| KernelError::Internal(anyhow::Error::new(e)))?;

            let mut event = NewEvent::new(
                data.event_type(),
                run_stream(run_workspace.unwrap_or_else(Uuid::nil), run_room),
                ActorRef::service("lease-sweeper").map_err(KernelError::Malformed)?,
                data.to_value(),
            )
            .for_run(run_id)
            .correlate(correlation_id);
            event.workspace_id = run_workspace;
            event.room_id = run_room;
            event.occurred_at = now;

            let (_, events) = self.store().append_in_tx(&mut tx, &event).await?;
            for event in &events {
                self.projections()
                    .apply_in_tx(&mut tx, event)
                    .await
                    .map_err(KernelError::Internal)?;
            }
            committed.extend(events);
            reclaimed.push(run_id);
        }

        tx.commit().await?;
        self.store().notify(&committed);
        Ok(reclaimed)
    }
}

fn release_terminal(
    run: &aegis_projection::reads::RunRow,
    expected: RunStatus,
) -> Result<(), KernelError> {
    if run.status == expected {
        // Terminal event already appended; claim already cleared.
        return Ok(());
    }
    if run.claim_token.is_some() {
        // The worker skipped the terminal lifecycle event.
        Err(KernelError::EvidenceRequired)
    } else {
        Err(KernelError::LeaseLost)
    }
}

fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

fn parse_opt_uuid(raw: Option<String>) -> Result<Option<Uuid>, KernelError> {
    raw.map(|s| {
        Uuid::parse_str(&s).map_err(|e| KernelError::Internal(anyhow::Error::new(e)))
    })
    .transpose()
}
