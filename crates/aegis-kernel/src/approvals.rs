//! Approval operations: request and decide.
//!
//! Both operations are an appended event plus a projection update in one
//! transaction. Decision races between two deciders are resolved by append
//! order: the projector accepts the first sequenced decision and skips the
//! rest, and the loser surfaces here as `already_decided`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use aegis_projection::reads::{self, ApprovalRow};
use aegis_store_core::NewEvent;
use aegis_types::{ActorRef, ApprovalScope, ApprovalStatus, EventData, StreamRef};

use crate::{Kernel, KernelError};

/// Input to [`Kernel::request_approval`].
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Workspace the approval belongs to.
    pub workspace_id: Uuid,
    /// Room the request originates from, if any.
    pub room_id: Option<Uuid>,
    /// The action the approval would allow.
    pub action: String,
    /// The domain over which the approval would apply.
    pub scope: ApprovalScope,
    /// Who is asking.
    pub requester: ActorRef,
    /// Free-form requester context.
    pub context: Option<Value>,
}

/// Input to [`Kernel::decide_approval`].
#[derive(Debug, Clone)]
pub struct DecideOutcome {
    /// `approved`, `denied`, or `held`.
    pub outcome: ApprovalStatus,
    /// Who decided.
    pub decider: ActorRef,
    /// Optional decider comment.
    pub comment: Option<String>,
    /// When an `approved` grant stops matching.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Kernel {
    /// Request an approval; returns the pending row.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalRow, KernelError> {
        if request.action.trim().is_empty() {
            return Err(KernelError::Malformed("action cannot be empty".into()));
        }
        let approval_id = Uuid::new_v4();
        let data = EventData::ApprovalRequested {
            approval_id,
            action: request.action.clone(),
            scope: request.scope.clone(),
            context: request.context.clone(),
        };
        let stream = match request.room_id {
            Some(room_id) => StreamRef::room(room_id),
            None => StreamRef::workspace(request.workspace_id),
        };
        let mut event = NewEvent::new(
            data.event_type(),
            stream,
            request.requester.clone(),
            data.to_value(),
        );
        event.workspace_id = Some(request.workspace_id);
        event.room_id = request.room_id;
        self.commit_event(event).await?;

        reads::approval_by_id(self.pool(), approval_id)
            .await
            .map_err(KernelError::Internal)?
            .ok_or_else(|| KernelError::NotFound(format!("approval {approval_id}")))
    }

    /// Decide (or hold) a pending approval.
    ///
    /// Returns the decided row, or `already_decided` when another decision
    /// was sequenced first.
    pub async fn decide_approval(
        &self,
        approval_id: Uuid,
        decision: DecideOutcome,
    ) -> Result<ApprovalRow, KernelError> {
        if decision.outcome == ApprovalStatus::Pending {
            return Err(KernelError::Malformed("outcome cannot be pending".into()));
        }
        let current = reads::approval_by_id(self.pool(), approval_id)
            .await
            .map_err(KernelError::Internal)?
            .ok_or_else(|| KernelError::NotFound(format!("approval {approval_id}")))?;

        if !current.status.can_transition_to(decision.outcome) {
            return Err(if current.status.is_terminal() {
                KernelError::AlreadyDecided
            } else {
                KernelError::InvalidState(format!(
                    "{} cannot move to {}",
                    current.status.as_str(),
                    decision.outcome.as_str()
                ))
            });
        }

        let data = EventData::ApprovalDecided {
            approval_id,
            outcome: decision.outcome,
            comment: decision.comment.clone(),
            expires_at: decision.expires_at,
        };
        let stream = match current.room_id {
            Some(room_id) => StreamRef::room(room_id),
            None => StreamRef::workspace(
                current.workspace_id.unwrap_or_else(Uuid::nil),
            ),
        };
        let mut event = NewEvent::new(
            data.event_type(),
            stream,
            decision.decider.clone(),
            data.to_value(),
        );
        event.workspace_id = current.workspace_id;
        event.room_id = current.room_id;
        let receipt = self.commit_event(event).await?;

        let updated = reads::approval_by_id(self.pool(), approval_id)
            .await
            .map_err(KernelError::Internal)?
            .ok_or_else(|| KernelError::NotFound(format!("approval {approval_id}")))?;

        // The projector only records the decision event that won the race.
        if updated.decision_event_id != Some(receipt.event.event_id) {
            return Err(KernelError::AlreadyDecided);
        }
        Ok(updated)
    }
}
