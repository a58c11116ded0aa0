#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-kernel** – Coordination core of Aegis.
//!
//! The kernel ties the event store, the projection engine, and the policy
//! gate together behind one façade. Every state transition it performs is
//! an appended event plus a projection update, committed in a single
//! transaction; the policy gate is consulted before outward-facing actions,
//! and its negative verdicts are themselves recorded as events.
//!
//! The kernel is stateless between requests. All coordination happens
//! through the transactional backend, which is what lets multiple worker
//! processes share queued work safely (see [`leases`]).

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::debug;

use aegis_policy::{PolicyConfig, PolicyError, PolicyGate};
use aegis_projection::ProjectionEngine;
use aegis_store_core::{AppendReceipt, EventStore, NewEvent, StoreError};
use aegis_store_sqlite::SqliteEventStore;
use aegis_types::ReasonCode;

pub mod approvals;
pub mod conversations;
pub mod leases;
pub mod policy_host;
pub mod runs;
pub mod tail;

pub use approvals::{ApprovalRequest, DecideOutcome};
pub use leases::{ClaimedRun, HeartbeatOutcome, ReleaseState};
pub use policy_host::{KernelPolicyStore, LearningEntry, LearningSink, TracingLearningSink};
pub use runs::CreateRun;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Timing parameters of the claim-lease coordinator.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// How long a claim's lease lasts without renewal. Default 1800 s.
    pub lease_duration: std::time::Duration,
    /// Heartbeats arriving faster than this are throttled. Default 10 s.
    pub heartbeat_min_interval: std::time::Duration,
    /// Longest a run may stay continuously claimed by one actor before
    /// forced reclamation. Default 900 s.
    pub max_claim_age: std::time::Duration,
    /// Policy gate configuration.
    pub policy: PolicyConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            lease_duration: std::time::Duration::from_secs(1800),
            heartbeat_min_interval: std::time::Duration::from_secs(10),
            max_claim_age: std::time::Duration::from_secs(900),
            policy: PolicyConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Validate parameter sanity at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_duration.is_zero() {
            return Err("lease_duration must be positive".into());
        }
        if self.heartbeat_min_interval >= self.lease_duration / 3 {
            return Err("heartbeat_min_interval must be below lease_duration / 3".into());
        }
        if self.max_claim_age.is_zero() {
            return Err("max_claim_age must be positive".into());
        }
        Ok(())
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Caller-visible kernel failures, each mapped to a stable reason code.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A terminal run outcome needs a non-empty evidence reference.
    #[error("evidence reference required")]
    EvidenceRequired,
    /// The caller's claim token no longer owns the run's lease.
    #[error("lease lost")]
    LeaseLost,
    /// The requested transition is not in the state machine.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Another decider already resolved the approval.
    #[error("approval already decided")]
    AlreadyDecided,
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request failed contract validation.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Event store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Policy evaluation failure.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Unexpected backend failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for KernelError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl KernelError {
    /// The stable reason code for this failure.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::EvidenceRequired => ReasonCode::EvidenceRequired,
            Self::LeaseLost => ReasonCode::LeaseLost,
            Self::InvalidState(_) => ReasonCode::InvalidState,
            Self::AlreadyDecided => ReasonCode::AlreadyDecided,
            Self::NotFound(_) => ReasonCode::NotFound,
            Self::Malformed(_) => ReasonCode::MalformedRequest,
            Self::Store(StoreError::SecretDetected(_)) => ReasonCode::SecretDetected,
            Self::Store(StoreError::AllocationFailure) => ReasonCode::AllocationFailure,
            Self::Store(StoreError::HashChainBreak(_)) => ReasonCode::HashChainBreak,
            Self::Store(StoreError::Malformed(_)) => ReasonCode::MalformedRequest,
            Self::Store(StoreError::NotFound(_)) => ReasonCode::NotFound,
            Self::Store(_) | Self::Policy(_) | Self::Internal(_) => ReasonCode::Internal,
        }
    }
}

//─────────────────────────────
//  Kernel
//─────────────────────────────

/// The assembled kernel: store, projections, gate, and configuration.
pub struct Kernel {
    pool: SqlitePool,
    store: Arc<SqliteEventStore>,
    projections: Arc<ProjectionEngine>,
    gate: PolicyGate<KernelPolicyStore>,
    config: KernelConfig,
    learning: Arc<dyn LearningSink>,
}

impl Kernel {
    /// Assemble a kernel over `store` with `config`.
    pub async fn new(store: Arc<SqliteEventStore>, config: KernelConfig) -> Result<Self, KernelError> {
        Self::with_learning(store, config, Arc::new(TracingLearningSink)).await
    }

    /// Assemble a kernel with an explicit learning sink.
    pub async fn with_learning(
        store: Arc<SqliteEventStore>,
        config: KernelConfig,
        learning: Arc<dyn LearningSink>,
    ) -> Result<Self, KernelError> {
        config.validate().map_err(KernelError::Malformed)?;
        let pool = store.pool().clone();
        let projections = Arc::new(
            ProjectionEngine::new(pool.clone(), ProjectionEngine::default_projectors())
                .await
                .map_err(KernelError::Internal)?,
        );
        let policy_store = KernelPolicyStore::new(pool.clone()).await?;
        let gate = PolicyGate::new(policy_store, config.policy.clone());
        Ok(Self { pool, store, projections, gate, config, learning })
    }

    /// The event store this kernel writes through.
    pub fn store(&self) -> &Arc<SqliteEventStore> {
        &self.store
    }

    /// The projection engine and its read models.
    pub fn projections(&self) -> &Arc<ProjectionEngine> {
        &self.projections
    }

    /// The policy gate (kill switch and enforcement mode live here).
    pub fn gate(&self) -> &PolicyGate<KernelPolicyStore> {
        &self.gate
    }

    /// The lease configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The shared backend pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append an event and apply projections in one transaction.
    pub(crate) async fn commit_event(
        &self,
        new_event: NewEvent,
    ) -> Result<AppendReceipt, KernelError> {
        let mut tx = self.pool.begin().await?;
        let (receipt, committed) = self.store.append_in_tx(&mut tx, &new_event).await?;
        for event in &committed {
            self.projections
                .apply_in_tx(&mut tx, event)
                .await
                .map_err(KernelError::Internal)?;
        }
        tx.commit().await?;
        self.store.notify(&committed);
        if receipt.replayed {
            debug!(event_id = %receipt.event.event_id, "idempotent replay");
        }
        Ok(receipt)
    }

    /// Rebuild every projection by replaying the full event history.
    pub async fn rebuild_projections(&self) -> Result<(), KernelError> {
        let events = self
            .store
            .query(aegis_store_core::EventFilter::default())
            .await?;
        self.projections
            .rebuild_from(&events)
            .await
            .map_err(KernelError::Internal)
    }
}
