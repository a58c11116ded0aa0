//! Policy gate hosting: store access, negative-decision events, learning.
//!
//! The gate itself (in `aegis-policy`) is a deterministic function; this
//! module supplies its persistence ([`KernelPolicyStore`]) and performs the
//! side effects the contract demands: every non-allow decision is appended
//! as a `policy.denied` / `policy.requires_approval` event, and a learning
//! entry is recorded on a spawned task whose failure is logged but can
//! never fail the decision.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use aegis_capability::{CapabilityRecord, SqliteTokenRegistry, TokenRegistry};
use aegis_policy::{ActionRequest, ApprovalGrant, Decision, PolicyStore};
use aegis_projection::reads;
use aegis_store_core::canonical::canonical_timestamp;
use aegis_store_core::NewEvent;
use aegis_types::{DecisionKind, EventData, StreamRef};

use crate::{Kernel, KernelError};

//─────────────────────────────
//  Store implementation
//─────────────────────────────

/// [`PolicyStore`] over the kernel's shared pool.
pub struct KernelPolicyStore {
    pool: SqlitePool,
    registry: SqliteTokenRegistry,
}

impl KernelPolicyStore {
    /// Build the store, creating the egress log and token registry tables.
    pub async fn new(pool: SqlitePool) -> Result<Self, KernelError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS egress_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                principal_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_egress_principal \
             ON egress_log (principal_id, occurred_at)",
        )
        .execute(&pool)
        .await?;
        let registry = SqliteTokenRegistry::new(pool.clone())
            .await
            .map_err(KernelError::Internal)?;
        Ok(Self { pool, registry })
    }

    /// The capability token registry.
    pub fn registry(&self) -> &SqliteTokenRegistry {
        &self.registry
    }

    /// Record one egress for quota accounting.
    pub async fn record_egress(
        &self,
        principal_id: Uuid,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        sqlx::query(
            "INSERT INTO egress_log (principal_id, domain, occurred_at) VALUES (?, ?, ?)",
        )
        .bind(principal_id.to_string())
        .bind(domain)
        .bind(canonical_timestamp(&now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for KernelPolicyStore {
    async fn active_approvals(
        &self,
        workspace_id: Uuid,
        action: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ApprovalGrant>> {
        let rows = reads::active_approvals(&self.pool, workspace_id, action, now).await?;
        Ok(rows
            .into_iter()
            .map(|row| ApprovalGrant { scope: row.scope, expires_at: row.expires_at })
            .collect())
    }

    async fn capability(&self, token_id: &str) -> anyhow::Result<Option<CapabilityRecord>> {
        self.registry.get(token_id).await
    }

    async fn is_quarantined(&self, principal_id: Uuid) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT quarantined FROM principals WHERE principal_id = ?")
            .bind(principal_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("quarantined") != 0).unwrap_or(false))
    }

    async fn egress_count_last_hour(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let window_start = now - Duration::hours(1);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM egress_log WHERE principal_id = ? AND occurred_at > ?",
        )
        .bind(principal_id.to_string())
        .bind(canonical_timestamp(&window_start))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }
}

//─────────────────────────────
//  Learning sink
//─────────────────────────────

/// One learning-from-failure record produced by a negative decision.
#[derive(Debug, Clone)]
pub struct LearningEntry {
    /// The refused or escalated action.
    pub action: String,
    /// The asking actor's id.
    pub actor_id: String,
    /// The verdict that triggered the record.
    pub decision: Decision,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

/// Receives learning entries; failures are isolated from the decision path.
#[async_trait]
pub trait LearningSink: Send + Sync {
    /// Record one entry.
    async fn record(&self, entry: LearningEntry) -> anyhow::Result<()>;
}

/// Default sink: structured log only.
pub struct TracingLearningSink;

#[async_trait]
impl LearningSink for TracingLearningSink {
    async fn record(&self, entry: LearningEntry) -> anyhow::Result<()> {
        debug!(
            action = entry.action,
            actor = entry.actor_id,
            decision = entry.decision.decision.as_str(),
            reason_code = entry.decision.reason_code.as_str(),
            "negative policy decision recorded"
        );
        Ok(())
    }
}

//─────────────────────────────
//  Kernel-side evaluation
//─────────────────────────────

impl Kernel {
    /// Evaluate a proposed action through the gate, recording negative
    /// decisions as events and learning entries.
    pub async fn evaluate_policy(
        &self,
        mut request: ActionRequest,
    ) -> Result<Decision, KernelError> {
        if request.principal_id.is_none() {
            request.principal_id = self.lookup_principal(&request.actor.id).await?;
        }

        let decision = self.gate.evaluate(&request).await?;

        if decision.is_allow() {
            // Count allowed egress against the hourly quota.
            if let Some(domain) = request
                .context
                .as_ref()
                .and_then(|c| c.egress.as_ref())
                .map(|e| e.domain.clone())
            {
                if let Some(principal_id) = request.principal_id {
                    self.policy_store()
                        .record_egress(principal_id, &domain, Utc::now())
                        .await?;
                }
            }
            return Ok(decision);
        }

        self.record_negative_decision(&request, &decision).await?;

        let entry = LearningEntry {
            action: request.action.clone(),
            actor_id: request.actor.id.clone(),
            decision: decision.clone(),
            decided_at: Utc::now(),
        };
        let sink = self.learning_sink();
        tokio::spawn(async move {
            if let Err(err) = sink.record(entry).await {
                warn!(error = %err, "learning sink failed; decision unaffected");
            }
        });

        Ok(decision)
    }

    /// Mint a capability token: register its claims and return the `jti`.
    ///
    /// The wire JWT is produced by `aegis-capability`; the gate decides
    /// from the registry row, so the `jti` alone identifies the capability.
    pub async fn register_capability(
        &self,
        claims: &aegis_capability::Claims,
    ) -> Result<(), KernelError> {
        self.policy_store()
            .registry()
            .register(claims)
            .await
            .map_err(KernelError::Internal)
    }

    /// Revoke a capability token by `jti`.
    pub async fn revoke_capability(&self, jti: &str) -> Result<(), KernelError> {
        self.policy_store()
            .registry()
            .revoke(jti)
            .await
            .map_err(KernelError::Internal)
    }

    async fn record_negative_decision(
        &self,
        request: &ActionRequest,
        decision: &Decision,
    ) -> Result<(), KernelError> {
        let stream = if let Some(room_id) = request.room_id {
            StreamRef::room(room_id)
        } else if let Some(workspace_id) = request.workspace_id {
            StreamRef::workspace(workspace_id)
        } else {
            debug!(action = request.action, "negative decision outside any stream scope");
            return Ok(());
        };

        let data = match decision.decision {
            DecisionKind::Deny => EventData::PolicyDenied {
                action: request.action.clone(),
                reason_code: decision.reason_code,
                reason: decision.reason.clone(),
            },
            DecisionKind::RequireApproval => EventData::PolicyRequiresApproval {
                action: request.action.clone(),
                reason_code: decision.reason_code,
                reason: decision.reason.clone(),
            },
            DecisionKind::Allow => return Ok(()),
        };

        let mut event = NewEvent::new(
            data.event_type(),
            stream,
            request.actor.clone(),
            data.to_value(),
        )
        .in_zone(request.zone);
        event.workspace_id = request.workspace_id;
        event.room_id = request.room_id;
        event.run_id = request.run_id;
        self.commit_event(event).await?;
        Ok(())
    }

    async fn lookup_principal(&self, actor_id: &str) -> Result<Option<Uuid>, KernelError> {
        let row = sqlx::query("SELECT principal_id FROM principals WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            Uuid::parse_str(&r.get::<String, _>("principal_id"))
                .map_err(|e| KernelError::Internal(anyhow::Error::new(e)))
        })
        .transpose()
    }

    pub(crate) fn policy_store(&self) -> &KernelPolicyStore {
        self.gate.store()
    }

    pub(crate) fn learning_sink(&self) -> std::sync::Arc<dyn LearningSink> {
        self.learning.clone()
    }
}
