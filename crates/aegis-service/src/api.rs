//! Wire types for the HTTP surface.
//!
//! Every request body carries a `schema_version`; the server accepts the
//! current version and the previous minor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use aegis_policy::ActionRequest;
use aegis_types::{ActorRef, ApprovalScope, ApprovalStatus};

use crate::error::ApiError;

/// The schema version this server speaks.
pub const CURRENT_SCHEMA_VERSION: &str = "2.1";

/// The versions the server accepts (current plus previous minor).
pub const ACCEPTED_SCHEMA_VERSIONS: &[&str] = &["2.1", "2.0"];

fn default_schema_version() -> String {
    CURRENT_SCHEMA_VERSION.to_string()
}

/// Reject bodies outside the accepted schema window.
pub fn check_schema_version(version: &str) -> Result<(), ApiError> {
    if ACCEPTED_SCHEMA_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(ApiError::unsupported_schema_version(version))
    }
}

/// Validate a caller-supplied actor reference.
pub fn check_actor(actor: &ActorRef) -> Result<(), ApiError> {
    ActorRef::new(actor.kind, actor.id.clone())
        .map(|_| ())
        .map_err(ApiError::malformed)
}

//─────────────────────────────
//  Requests
//─────────────────────────────

/// `POST /v1/rooms`
#[derive(Debug, Deserialize)]
pub struct CreateRoomBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Workspace the room belongs to.
    pub workspace_id: Uuid,
    /// Display name.
    pub name: String,
    /// Who is creating the room.
    pub actor: ActorRef,
}

/// `POST /v1/rooms/:room_id/threads`
#[derive(Debug, Deserialize)]
pub struct CreateThreadBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Thread title.
    pub title: String,
    /// Who is opening the thread.
    pub actor: ActorRef,
}

/// `POST /v1/threads/:thread_id/messages`
#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// The room whose stream the message is sequenced on.
    pub room_id: Uuid,
    /// Message body.
    pub body: String,
    /// Who is posting.
    pub actor: ActorRef,
    /// Makes repeated posts no-ops.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// `POST /v1/policy/evaluate`
#[derive(Debug, Deserialize)]
pub struct EvaluateBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// The proposed action.
    #[serde(flatten)]
    pub request: ActionRequest,
}

/// `POST /v1/approvals`
#[derive(Debug, Deserialize)]
pub struct CreateApprovalBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Workspace the approval belongs to.
    pub workspace_id: Uuid,
    /// Room the request originates from.
    #[serde(default)]
    pub room_id: Option<Uuid>,
    /// The action the approval would allow.
    pub action: String,
    /// The domain the approval would cover.
    pub scope: ApprovalScope,
    /// Who is asking.
    pub requester: ActorRef,
    /// Free-form requester context.
    #[serde(default)]
    pub context: Option<Value>,
}

/// `POST /v1/approvals/:id/decide`
#[derive(Debug, Deserialize)]
pub struct DecideApprovalBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// `approved`, `denied`, or `held`.
    pub outcome: ApprovalStatus,
    /// Who decided.
    pub decider: ActorRef,
    /// Optional decider comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// When an `approved` grant stops matching.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// `POST /v1/runs`
#[derive(Debug, Deserialize)]
pub struct CreateRunBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Workspace the run belongs to.
    pub workspace_id: Uuid,
    /// Room the run belongs to.
    #[serde(default)]
    pub room_id: Option<Uuid>,
    /// What the run should accomplish.
    pub goal: String,
    /// Who is creating it.
    pub actor: ActorRef,
    /// Correlation id; fresh when absent.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

/// `POST /v1/runs/claim`
#[derive(Debug, Deserialize)]
pub struct ClaimBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Restrict claiming to one workspace.
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    /// The claiming worker's actor id.
    pub actor_id: String,
    /// Maximum number of runs to claim.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_batch_limit() -> usize {
    1
}

/// `POST /v1/runs/:id/lease/heartbeat`
#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// The lease handle being renewed.
    pub claim_token: String,
}

/// `POST /v1/runs/:id/lease/release`
#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// The lease handle being surrendered.
    pub claim_token: String,
    /// `released`, `completed`, or `failed`.
    pub final_state: ReleaseStateBody,
    /// Who is releasing.
    pub actor: ActorRef,
}

/// Wire form of the release final state.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStateBody {
    /// Return the run to the queue.
    Released,
    /// Run finished successfully.
    Completed,
    /// Run finished unsuccessfully.
    Failed,
}

/// `POST /v1/runs/:id/start`
#[derive(Debug, Deserialize)]
pub struct StartRunBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// The starting worker.
    pub actor: ActorRef,
    /// The worker's lease handle.
    pub claim_token: String,
}

/// `POST /v1/runs/:id/steps`
#[derive(Debug, Deserialize)]
pub struct AddStepBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// What the step does.
    pub title: String,
    /// Who is recording it.
    pub actor: ActorRef,
}

/// `POST /v1/runs/:id/complete`
#[derive(Debug, Deserialize)]
pub struct CompleteRunBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Durable pointer to the evidence bundle.
    pub evidence_ref: String,
    /// The finishing worker.
    pub actor: ActorRef,
    /// The worker's lease handle.
    pub claim_token: String,
}

/// `POST /v1/runs/:id/fail`
#[derive(Debug, Deserialize)]
pub struct FailRunBody {
    /// Request schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// What went wrong.
    pub error: String,
    /// Durable pointer to the evidence bundle.
    pub evidence_ref: String,
    /// The finishing worker.
    pub actor: ActorRef,
    /// The worker's lease handle.
    pub claim_token: String,
}

//─────────────────────────────
//  Query parameters
//─────────────────────────────

/// `GET /v1/streams/rooms/:room_id` parameters.
#[derive(Debug, Deserialize)]
pub struct TailParams {
    /// Resume after this sequence (0 for the whole stream).
    #[serde(default)]
    pub from_seq: u64,
}

/// `GET /v1/approvals` filters.
#[derive(Debug, Deserialize)]
pub struct ApprovalFilters {
    /// Restrict to one workspace.
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    /// Restrict to one status.
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
}

/// `GET /v1/runs` filters.
#[derive(Debug, Deserialize)]
pub struct RunFilters {
    /// Restrict to one workspace.
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    /// Restrict to one status.
    #[serde(default)]
    pub status: Option<aegis_types::RunStatus>,
    /// Cap the result count.
    #[serde(default)]
    pub limit: Option<u64>,
}

/// `GET /v1/events` filters.
#[derive(Debug, Deserialize)]
pub struct EventQueryParams {
    /// Restrict to one stream type.
    #[serde(default)]
    pub stream_type: Option<String>,
    /// Restrict to one stream id.
    #[serde(default)]
    pub stream_id: Option<Uuid>,
    /// Only events past this sequence.
    #[serde(default)]
    pub from_seq: Option<u64>,
    /// Restrict to one run.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Restrict to one correlation chain.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Cap the result count.
    #[serde(default)]
    pub limit: Option<u64>,
}

//─────────────────────────────
//  Responses
//─────────────────────────────

/// Versioned response wrapper.
#[derive(Debug, Serialize)]
pub struct Versioned<T: Serialize> {
    /// The schema version of this response.
    pub schema_version: &'static str,
    /// The payload.
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Versioned<T> {
    /// Wrap a payload under the current schema version.
    pub fn new(data: T) -> Self {
        Self { schema_version: CURRENT_SCHEMA_VERSION, data }
    }
}

/// Response carrying a single created id.
#[derive(Debug, Serialize)]
pub struct CreatedId {
    /// The created entity's id.
    pub id: Uuid,
}

/// One claim handed to a worker.
#[derive(Debug, Serialize)]
pub struct ClaimedRunBody {
    /// The claimed run.
    pub run_id: Uuid,
    /// The lease handle.
    pub claim_token: String,
    /// When the lease expires unless renewed.
    pub lease_expires_at: DateTime<Utc>,
}

/// `POST /v1/runs/claim` response.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    /// The claims taken in this batch.
    pub claimed: Vec<ClaimedRunBody>,
}

/// `POST /v1/runs/:id/lease/heartbeat` response.
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// `renewed` or `throttled`.
    pub outcome: &'static str,
    /// The lease expiry after the heartbeat.
    pub lease_expires_at: DateTime<Utc>,
}
