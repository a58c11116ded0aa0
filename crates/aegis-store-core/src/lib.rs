#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-store-core** – Core event-store abstractions for Aegis.
//!
//! This crate defines the durable event envelope, its canonical byte form,
//! the SHA-256 hash chain, chain verification, the pre-commit secret scanner
//! hook, and the [`EventStore`] trait implemented by the storage drivers.
//! It performs no I/O of its own; drivers (in-memory, SQLite) live in
//! sibling crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use aegis_types::{ActorRef, RedactionLevel, StreamRef, StreamType, Zone};

pub mod canonical;
pub mod chain;
pub mod scan;

pub use chain::{verify_events, ChainReport, ChainViolation};
pub use scan::{MarkerScanner, NoopScanner, ScanOutcome, SecretPolicy, SecretScanner};

//─────────────────────────────
//  Event identifiers
//─────────────────────────────

/// Unique identifier for a committed event (UUID v4).
pub type EventId = Uuid;

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// An immutable, persisted event.
///
/// Everything the kernel records flows through this envelope: conversational
/// surface, policy decisions, approvals, run lifecycle, and security
/// annotations. Once committed an envelope is never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event id.
    pub event_id: EventId,
    /// Event type tag, e.g. `run.created`.
    pub event_type: String,
    /// Payload schema version for this event type.
    pub event_version: u32,
    /// Wall-clock time the event occurred (canonicalized to milliseconds).
    pub occurred_at: DateTime<Utc>,

    /// Workspace the event belongs to, if scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Uuid>,
    /// Room the event belongs to, if scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    /// Thread the event belongs to, if scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    /// Run the event belongs to, if scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Step the event belongs to, if scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,

    /// Who caused the event.
    pub actor: ActorRef,
    /// Durable principal resolved from the actor at append time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_principal_id: Option<Uuid>,
    /// Security posture the event was recorded under.
    pub zone: Zone,

    /// The stream this event is sequenced on.
    pub stream: StreamRef,
    /// Per-stream monotonic sequence, assigned at append.
    pub stream_seq: u64,

    /// Correlation id shared by all events of one logical operation.
    pub correlation_id: Uuid,
    /// The event that directly caused this one, when known. Semantically
    /// nullable: serialized as `null` rather than omitted.
    pub causation_id: Option<Uuid>,

    /// How much of the payload has been redacted.
    pub redaction_level: RedactionLevel,
    /// Whether the secret scanner flagged the payload.
    pub contains_secrets: bool,

    /// Policy evaluation context captured at append time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_ctx: Option<Value>,
    /// Model invocation context captured at append time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ctx: Option<Value>,
    /// Display hints for UIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_ctx: Option<Value>,

    /// Opaque payload; a tagged union at the kernel/API layers.
    pub data: Value,

    /// Per-stream idempotency key making repeated appends no-ops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Hash of the previous event in the stream. Semantically nullable:
    /// `null` for the first event of a stream.
    pub prev_event_hash: Option<String>,
    /// SHA-256 over the canonical envelope and the previous hash, lowercase
    /// hex.
    pub event_hash: String,
}

//─────────────────────────────
//  Append input
//─────────────────────────────

/// A not-yet-persisted event: everything the caller supplies.
///
/// Sequence, chain fields, and (when absent) the resolved principal and
/// default zone are filled in by the store's append transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event type tag, e.g. `run.created`.
    pub event_type: String,
    /// Payload schema version for this event type.
    pub event_version: u32,
    /// Wall-clock time the event occurred.
    pub occurred_at: DateTime<Utc>,
    /// Workspace scope, if any.
    pub workspace_id: Option<Uuid>,
    /// Room scope, if any.
    pub room_id: Option<Uuid>,
    /// Thread scope, if any.
    pub thread_id: Option<Uuid>,
    /// Run scope, if any.
    pub run_id: Option<Uuid>,
    /// Step scope, if any.
    pub step_id: Option<Uuid>,
    /// Who is causing the event.
    pub actor: ActorRef,
    /// Security posture; defaults to `supervised` when `None`.
    pub zone: Option<Zone>,
    /// The stream to sequence the event on.
    pub stream: StreamRef,
    /// Correlation id; a fresh one is a fine default for root events.
    pub correlation_id: Uuid,
    /// Direct cause, when known.
    pub causation_id: Option<Uuid>,
    /// Redaction level; defaults to `none`.
    pub redaction_level: RedactionLevel,
    /// Policy context object.
    pub policy_ctx: Option<Value>,
    /// Model context object.
    pub model_ctx: Option<Value>,
    /// Display context object.
    pub display_ctx: Option<Value>,
    /// The payload.
    pub data: Value,
    /// Per-stream idempotency key.
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    /// Start a new event for `stream` with the minimum required fields.
    pub fn new(
        event_type: impl Into<String>,
        stream: StreamRef,
        actor: ActorRef,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_version: 1,
            occurred_at: Utc::now(),
            workspace_id: None,
            room_id: None,
            thread_id: None,
            run_id: None,
            step_id: None,
            actor,
            zone: None,
            stream,
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            redaction_level: RedactionLevel::None,
            policy_ctx: None,
            model_ctx: None,
            display_ctx: None,
            data,
            idempotency_key: None,
        }
    }

    /// Scope the event to a workspace.
    pub fn in_workspace(mut self, workspace_id: Uuid) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    /// Scope the event to a room.
    pub fn in_room(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    /// Scope the event to a thread.
    pub fn in_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Scope the event to a run.
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Scope the event to a step.
    pub fn for_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Use an explicit correlation id instead of a fresh one.
    pub fn correlate(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Chain causation from a triggering event.
    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Record under an explicit security zone.
    pub fn in_zone(mut self, zone: Zone) -> Self {
        self.zone = Some(zone);
        self
    }

    /// Make repeated appends of this event no-ops.
    pub fn idempotent(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Validate caller-supplied fields before append.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.event_type.trim().is_empty() {
            return Err(StoreError::Malformed("event_type cannot be empty".into()));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > aegis_types::MAX_IDEMPOTENCY_KEY_LEN {
                return Err(StoreError::Malformed("idempotency key length out of range".into()));
            }
        }
        let payload_len = self.data.to_string().len();
        if payload_len > aegis_types::MAX_EVENT_DATA_LEN {
            return Err(StoreError::Malformed(format!(
                "event data too large: {} > {}",
                payload_len,
                aegis_types::MAX_EVENT_DATA_LEN
            )));
        }
        Ok(())
    }
}

/// The result of an append: the persisted envelope plus whether it was an
/// idempotent replay of a previously committed event.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    /// The persisted envelope (pre-existing one on replay).
    pub event: EventEnvelope,
    /// `true` when the idempotency key matched an existing event and no new
    /// sequence was allocated.
    pub replayed: bool,
}

//─────────────────────────────
//  Queries
//─────────────────────────────

/// Filter for event queries. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Restrict to one stream type.
    pub stream_type: Option<StreamType>,
    /// Restrict to one stream id.
    pub stream_id: Option<Uuid>,
    /// Only events with `stream_seq > from_seq`.
    pub from_seq: Option<u64>,
    /// Restrict to one run.
    pub run_id: Option<Uuid>,
    /// Restrict to one correlation chain.
    pub correlation_id: Option<Uuid>,
    /// Cap the number of returned events.
    pub limit: Option<u64>,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by event-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Caller-supplied input failed contract validation.
    #[error("malformed event: {0}")]
    Malformed(String),
    /// The sequence allocator could not return exactly one row.
    #[error("sequence allocation failed for stream")]
    AllocationFailure,
    /// The secret policy refuses to persist the payload.
    #[error("secret material detected in payload: {0:?}")]
    SecretDetected(Vec<String>),
    /// Chain verification found a violation.
    #[error("hash chain break: {0}")]
    HashChainBreak(ChainViolation),
    /// The referenced event or stream does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Backend failure; transient errors may be retried by the caller.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Abstraction over an append-only, hash-chained event store.
///
/// Drivers must make `append` atomic and serializable per stream: no gaps,
/// no duplicate sequences, idempotent replay on key collision, and the
/// append-order of a stream equal to its sequence order.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event: allocate its sequence, link and compute its hash,
    /// and persist it. Duplicate idempotency keys return the pre-existing
    /// event with `replayed = true`.
    async fn append(&self, new_event: NewEvent) -> Result<AppendReceipt, StoreError>;

    /// Read a stream in ascending sequence order, starting *after*
    /// `from_seq` (pass 0 for the whole stream).
    async fn read_stream(
        &self,
        stream: StreamRef,
        from_seq: u64,
        limit: Option<u64>,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    /// The highest sequence assigned on `stream`, or 0 when empty.
    async fn head_seq(&self, stream: StreamRef) -> Result<u64, StoreError>;

    /// Fetch one event by id.
    async fn event_by_id(&self, event_id: EventId) -> Result<Option<EventEnvelope>, StoreError>;

    /// Query events across streams with [`EventFilter`].
    async fn query(&self, filter: EventFilter) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Subscribe to envelopes as they commit, in commit order.
    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope>;

    /// Re-walk `stream` and verify sequence density and chain linkage.
    async fn verify_stream(&self, stream: StreamRef) -> Result<ChainReport, StoreError>;
}
