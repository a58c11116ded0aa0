//! Run lifecycle operations.
//!
//! `queued → running → {succeeded, failed, cancelled, timed_out}`; terminal
//! states absorb. Starting and terminating a run require the caller to hold
//! the live claim; terminal outcomes require a non-empty evidence
//! reference. Child entities (steps, tool calls, artifacts) inherit the
//! run's correlation id and chain causation from the run's latest event.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use aegis_projection::reads::{self, RunRow};
use aegis_store_core::NewEvent;
use aegis_types::{ActorRef, EventData, RunStatus, StreamRef};

use crate::{Kernel, KernelError};

/// Input to [`Kernel::create_run`].
#[derive(Debug, Clone)]
pub struct CreateRun {
    /// Workspace the run belongs to.
    pub workspace_id: Uuid,
    /// Room the run belongs to, if any.
    pub room_id: Option<Uuid>,
    /// What the run should accomplish.
    pub goal: String,
    /// Who is creating it.
    pub creator: ActorRef,
    /// Correlation id; a fresh one is used when absent.
    pub correlation_id: Option<Uuid>,
}

impl Kernel {
    /// Create a run in the `queued` state.
    pub async fn create_run(&self, request: CreateRun) -> Result<RunRow, KernelError> {
        if request.goal.trim().is_empty() {
            return Err(KernelError::Malformed("goal cannot be empty".into()));
        }
        if request.goal.len() > aegis_types::MAX_GOAL_LEN {
            return Err(KernelError::Malformed("goal too long".into()));
        }
        let run_id = Uuid::new_v4();
        let data = EventData::RunCreated { run_id, goal: request.goal.clone() };
        let mut event = NewEvent::new(
            data.event_type(),
            run_stream(request.workspace_id, request.room_id),
            request.creator.clone(),
            data.to_value(),
        )
        .for_run(run_id);
        event.workspace_id = Some(request.workspace_id);
        event.room_id = request.room_id;
        if let Some(correlation_id) = request.correlation_id {
            event.correlation_id = correlation_id;
        }
        self.commit_event(event).await?;

        self.load_run(run_id).await
    }

    /// Start a queued run. The caller must hold the live claim.
    pub async fn start_run(
        &self,
        run_id: Uuid,
        actor: ActorRef,
        claim_token: &str,
    ) -> Result<RunRow, KernelError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Queued {
            return Err(KernelError::InvalidState(format!(
                "run is {}, not queued",
                run.status.as_str()
            )));
        }
        self.verify_claim(&run, &actor, claim_token)?;

        let data = EventData::RunStarted { run_id };
        self.append_run_event(&run, actor, data, None).await?;
        self.load_run(run_id).await
    }

    /// Record a step under a running or queued (claimed) run.
    pub async fn add_step(
        &self,
        run_id: Uuid,
        title: String,
        actor: ActorRef,
    ) -> Result<Uuid, KernelError> {
        if title.trim().is_empty() {
            return Err(KernelError::Malformed("step title cannot be empty".into()));
        }
        let run = self.load_live_run(run_id).await?;
        let step_id = Uuid::new_v4();
        let data = EventData::StepAdded { run_id, step_id, title };
        self.append_run_event(&run, actor, data, Some(step_id)).await?;
        Ok(step_id)
    }

    /// Record a tool invocation under a run.
    pub async fn add_tool_call(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
        tool_name: String,
        request: Value,
        actor: ActorRef,
    ) -> Result<Uuid, KernelError> {
        let run = self.load_live_run(run_id).await?;
        let tool_call_id = Uuid::new_v4();
        let data = EventData::ToolCalled { run_id, tool_call_id, step_id, tool_name, request };
        self.append_run_event(&run, actor, data, step_id).await?;
        Ok(tool_call_id)
    }

    /// Attach an artifact to a run.
    pub async fn add_artifact(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
        kind: String,
        uri: String,
        actor: ActorRef,
    ) -> Result<Uuid, KernelError> {
        if uri.trim().is_empty() {
            return Err(KernelError::Malformed("artifact uri cannot be empty".into()));
        }
        let run = self.load_live_run(run_id).await?;
        let artifact_id = Uuid::new_v4();
        let data = EventData::ArtifactAdded { run_id, artifact_id, step_id, kind, uri };
        self.append_run_event(&run, actor, data, step_id).await?;
        Ok(artifact_id)
    }

    /// Terminate a run as succeeded. Requires the live claim and a
    /// non-empty evidence reference.
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        evidence_ref: &str,
        actor: ActorRef,
        claim_token: &str,
    ) -> Result<RunRow, KernelError> {
        self.terminate_run(run_id, actor, claim_token, evidence_ref, None).await
    }

    /// Terminate a run as failed. Requires the live claim and a non-empty
    /// evidence reference.
    pub async fn fail_run(
        &self,
        run_id: Uuid,
        error: String,
        evidence_ref: &str,
        actor: ActorRef,
        claim_token: &str,
    ) -> Result<RunRow, KernelError> {
        self.terminate_run(run_id, actor, claim_token, evidence_ref, Some(error)).await
    }

    /// Terminate a running run that exceeded its deadline. No claim
    /// required; this is the deadline-sweeper path, and the claim is
    /// cleared with the terminal transition.
    pub async fn timeout_run(
        &self,
        run_id: Uuid,
        actor: ActorRef,
    ) -> Result<RunRow, KernelError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(KernelError::InvalidState(format!(
                "run is {}, not running",
                run.status.as_str()
            )));
        }
        let data = EventData::RunTimedOut { run_id };
        self.append_run_event(&run, actor, data, None).await?;
        self.load_run(run_id).await
    }

    /// Withdraw a queued or running run. No claim required; this is the
    /// operator override path.
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        reason: Option<String>,
        actor: ActorRef,
    ) -> Result<RunRow, KernelError> {
        let run = self.load_run(run_id).await?;
        if !run.status.can_transition_to(RunStatus::Cancelled) {
            return Err(KernelError::InvalidState(format!(
                "run is {}, cannot cancel",
                run.status.as_str()
            )));
        }
        let data = EventData::RunCancelled { run_id, reason };
        self.append_run_event(&run, actor, data, None).await?;
        self.load_run(run_id).await
    }

    async fn terminate_run(
        &self,
        run_id: Uuid,
        actor: ActorRef,
        claim_token: &str,
        evidence_ref: &str,
        error: Option<String>,
    ) -> Result<RunRow, KernelError> {
        if evidence_ref.trim().is_empty() {
            return Err(KernelError::EvidenceRequired);
        }
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(KernelError::InvalidState(format!(
                "run is {}, not running",
                run.status.as_str()
            )));
        }
        self.verify_claim(&run, &actor, claim_token)?;

        let data = match error {
            None => EventData::RunCompleted { run_id, evidence_ref: evidence_ref.to_string() },
            Some(error) => EventData::RunFailed {
                run_id,
                error,
                evidence_ref: evidence_ref.to_string(),
            },
        };
        self.append_run_event(&run, actor, data, None).await?;
        self.load_run(run_id).await
    }

    //───────────────────── helpers ─────────────────────

    pub(crate) async fn load_run(&self, run_id: Uuid) -> Result<RunRow, KernelError> {
        reads::run_by_id(self.pool(), run_id)
            .await
            .map_err(KernelError::Internal)?
            .ok_or_else(|| KernelError::NotFound(format!("run {run_id}")))
    }

    async fn load_live_run(&self, run_id: Uuid) -> Result<RunRow, KernelError> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(KernelError::InvalidState(format!(
                "run is terminal ({})",
                run.status.as_str()
            )));
        }
        Ok(run)
    }

    pub(crate) fn verify_claim(
        &self,
        run: &RunRow,
        actor: &ActorRef,
        claim_token: &str,
    ) -> Result<(), KernelError> {
        let now = Utc::now();
        let token_matches = run.claim_token.as_deref() == Some(claim_token);
        let actor_matches = run.claimed_by_actor_id.as_deref() == Some(actor.id.as_str());
        if !token_matches || !actor_matches || !run.has_live_claim(now) {
            return Err(KernelError::LeaseLost);
        }
        Ok(())
    }

    async fn append_run_event(
        &self,
        run: &RunRow,
        actor: ActorRef,
        data: EventData,
        step_id: Option<Uuid>,
    ) -> Result<(), KernelError> {
        let workspace_id = run.workspace_id.unwrap_or_else(Uuid::nil);
        let mut event = NewEvent::new(
            data.event_type(),
            run_stream(workspace_id, run.room_id),
            actor,
            data.to_value(),
        )
        .for_run(run.run_id)
        .correlate(run.correlation_id);
        event.workspace_id = run.workspace_id;
        event.room_id = run.room_id;
        event.step_id = step_id;
        event.causation_id = run.last_event_id;
        self.commit_event(event).await?;
        Ok(())
    }
}

pub(crate) fn run_stream(workspace_id: Uuid, room_id: Option<Uuid>) -> StreamRef {
    match room_id {
        Some(room_id) => StreamRef::room(room_id),
        None => StreamRef::workspace(workspace_id),
    }
}
