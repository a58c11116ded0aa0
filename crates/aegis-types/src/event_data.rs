//! Typed event payloads.
//!
//! The store layer treats event `data` as an opaque JSON value; everything
//! above it (kernel, projectors, API) works with this tagged union instead.
//! The tag is the envelope's `event_type`, carried *outside* the payload, so
//! [`EventData::to_value`] strips it and [`EventData::parse`] reattaches it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::scope::ApprovalScope;
use crate::status::ApprovalStatus;
use crate::reason::ReasonCode;

/// Error raised when an event payload does not match its `event_type`.
#[derive(Debug, thiserror::Error)]
#[error("invalid payload for event type {event_type}: {source}")]
pub struct PayloadError {
    /// The event type the payload claimed to be.
    pub event_type: String,
    /// The underlying deserialization failure.
    #[source]
    pub source: serde_json::Error,
}

/// Tagged union of every event payload the kernel understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
#[non_exhaustive]
pub enum EventData {
    /// A room came into existence.
    #[serde(rename = "room.created")]
    RoomCreated {
        /// The new room's id.
        room_id: Uuid,
        /// Display name.
        name: String,
    },
    /// A thread was opened inside a room.
    #[serde(rename = "thread.created")]
    ThreadCreated {
        /// The new thread's id.
        thread_id: Uuid,
        /// The room the thread belongs to.
        room_id: Uuid,
        /// Thread title.
        title: String,
    },
    /// A message was posted to a thread.
    #[serde(rename = "message.posted")]
    MessagePosted {
        /// The message id.
        message_id: Uuid,
        /// The thread the message belongs to.
        thread_id: Uuid,
        /// Message body.
        body: String,
    },
    /// An approval was requested for an action.
    #[serde(rename = "approval.requested")]
    ApprovalRequested {
        /// The approval's id.
        approval_id: Uuid,
        /// The action the approval would allow.
        action: String,
        /// The domain over which the approval would apply.
        scope: ApprovalScope,
        /// Free-form requester context.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    /// A decider resolved (or held) an approval.
    #[serde(rename = "approval.decided")]
    ApprovalDecided {
        /// The approval's id.
        approval_id: Uuid,
        /// The outcome: `approved`, `denied`, or `held`.
        outcome: ApprovalStatus,
        /// Optional decider comment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        /// When an `approved` grant stops matching.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    /// The policy gate refused an action.
    #[serde(rename = "policy.denied")]
    PolicyDenied {
        /// The refused action.
        action: String,
        /// Machine-readable refusal reason.
        reason_code: ReasonCode,
        /// Human-readable refusal reason.
        reason: String,
    },
    /// The policy gate escalated an action to approval.
    #[serde(rename = "policy.requires_approval")]
    PolicyRequiresApproval {
        /// The escalated action.
        action: String,
        /// Machine-readable escalation reason.
        reason_code: ReasonCode,
        /// Human-readable escalation reason.
        reason: String,
    },
    /// A run was created and queued.
    #[serde(rename = "run.created")]
    RunCreated {
        /// The run's id.
        run_id: Uuid,
        /// What the run is trying to accomplish.
        goal: String,
    },
    /// A worker claimed a run's lease.
    ///
    /// The claim token is recorded so a projection rebuild reconstructs
    /// ownership exactly; the store is local-first and the token is a lease
    /// handle, not a credential.
    #[serde(rename = "run.claimed")]
    RunClaimed {
        /// The claimed run.
        run_id: Uuid,
        /// The lease handle issued to the worker.
        claim_token: String,
        /// The claiming worker's actor id.
        claimed_by_actor_id: String,
        /// When the lease expires unless renewed.
        lease_expires_at: DateTime<Utc>,
    },
    /// The claiming worker started executing the run.
    #[serde(rename = "run.started")]
    RunStarted {
        /// The started run.
        run_id: Uuid,
    },
    /// A step was added to a run.
    #[serde(rename = "run.step_added")]
    StepAdded {
        /// The parent run.
        run_id: Uuid,
        /// The new step's id.
        step_id: Uuid,
        /// What the step does.
        title: String,
    },
    /// A tool invocation was recorded under a run.
    #[serde(rename = "run.tool_called")]
    ToolCalled {
        /// The parent run.
        run_id: Uuid,
        /// The tool call's id.
        tool_call_id: Uuid,
        /// The step the call belongs to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<Uuid>,
        /// Name of the invoked tool.
        tool_name: String,
        /// The request payload handed to the tool.
        request: Value,
    },
    /// An artifact was attached to a run.
    #[serde(rename = "run.artifact_added")]
    ArtifactAdded {
        /// The parent run.
        run_id: Uuid,
        /// The artifact's id.
        artifact_id: Uuid,
        /// The step the artifact belongs to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<Uuid>,
        /// What kind of artifact this is (`log`, `diff`, `report`, …).
        kind: String,
        /// Durable pointer to the artifact's content.
        uri: String,
    },
    /// The run finished successfully.
    #[serde(rename = "run.completed")]
    RunCompleted {
        /// The finished run.
        run_id: Uuid,
        /// Durable pointer to the evidence bundle. Never empty.
        evidence_ref: String,
    },
    /// The run finished unsuccessfully.
    #[serde(rename = "run.failed")]
    RunFailed {
        /// The failed run.
        run_id: Uuid,
        /// What went wrong.
        error: String,
        /// Durable pointer to the evidence bundle. Never empty.
        evidence_ref: String,
    },
    /// The run was withdrawn.
    #[serde(rename = "run.cancelled")]
    RunCancelled {
        /// The cancelled run.
        run_id: Uuid,
        /// Why it was withdrawn.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The run exceeded its deadline.
    #[serde(rename = "run.timed_out")]
    RunTimedOut {
        /// The timed-out run.
        run_id: Uuid,
    },
    /// The sweeper reclaimed an expired lease.
    #[serde(rename = "run.lease_expired")]
    RunLeaseExpired {
        /// The run whose lease expired.
        run_id: Uuid,
        /// The worker that held the expired lease.
        claimed_by_actor_id: String,
    },
    /// A worker voluntarily released its claim.
    #[serde(rename = "run.released")]
    RunReleased {
        /// The released run.
        run_id: Uuid,
    },
    /// The secret scanner flagged another event's payload.
    #[serde(rename = "secret.detected")]
    SecretDetected {
        /// The event whose payload tripped the scanner.
        source_event_id: Uuid,
        /// Which markers matched.
        markers: Vec<String>,
    },
}

impl EventData {
    /// The envelope `event_type` string for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoomCreated { .. } => "room.created",
            Self::ThreadCreated { .. } => "thread.created",
            Self::MessagePosted { .. } => "message.posted",
            Self::ApprovalRequested { .. } => "approval.requested",
            Self::ApprovalDecided { .. } => "approval.decided",
            Self::PolicyDenied { .. } => "policy.denied",
            Self::PolicyRequiresApproval { .. } => "policy.requires_approval",
            Self::RunCreated { .. } => "run.created",
            Self::RunClaimed { .. } => "run.claimed",
            Self::RunStarted { .. } => "run.started",
            Self::StepAdded { .. } => "run.step_added",
            Self::ToolCalled { .. } => "run.tool_called",
            Self::ArtifactAdded { .. } => "run.artifact_added",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
            Self::RunCancelled { .. } => "run.cancelled",
            Self::RunTimedOut { .. } => "run.timed_out",
            Self::RunLeaseExpired { .. } => "run.lease_expired",
            Self::RunReleased { .. } => "run.released",
            Self::SecretDetected { .. } => "secret.detected",
        }
    }

    /// Serialize the payload fields alone, without the `event_type` tag.
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(self)
            .expect("event payloads are always serializable");
        if let Value::Object(ref mut map) = value {
            map.remove("event_type");
        }
        value
    }

    /// Reattach the `event_type` tag and parse a stored payload.
    pub fn parse(event_type: &str, data: &Value) -> Result<Self, PayloadError> {
        let mut tagged = data.clone();
        match tagged {
            Value::Object(ref mut map) => {
                map.insert("event_type".to_string(), Value::String(event_type.to_string()));
            }
            _ => {
                return Err(PayloadError {
                    event_type: event_type.to_string(),
                    source: serde::de::Error::custom("payload must be a JSON object"),
                })
            }
        }
        serde_json::from_value(tagged).map_err(|source| PayloadError {
            event_type: event_type.to_string(),
            source,
        })
    }
}
