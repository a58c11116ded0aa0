//! Cross-module kernel behavior: claims, leases, approvals, policy side
//! effects.

use std::sync::Arc;
use std::time::Duration;

use aegis_kernel::{
    ApprovalRequest, CreateRun, DecideOutcome, HeartbeatOutcome, Kernel, KernelConfig,
    KernelError, ReleaseState,
};
use aegis_policy::ActionRequest;
use aegis_projection::reads;
use aegis_store_core::{EventFilter, EventStore};
use aegis_store_sqlite::SqliteEventStore;
use aegis_types::{
    ActorRef, ApprovalScope, ApprovalStatus, DecisionKind, ReasonCode, RunStatus, Zone,
};
use uuid::Uuid;

fn fast_config() -> KernelConfig {
    KernelConfig {
        lease_duration: Duration::from_secs(2),
        heartbeat_min_interval: Duration::from_millis(100),
        max_claim_age: Duration::from_secs(30),
        ..Default::default()
    }
}

async fn kernel() -> Kernel {
    let store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    Kernel::new(store, fast_config()).await.unwrap()
}

fn worker() -> ActorRef {
    ActorRef::service("worker-a").unwrap()
}

async fn queued_run(kernel: &Kernel, workspace: Uuid) -> Uuid {
    kernel
        .create_run(CreateRun {
            workspace_id: workspace,
            room_id: None,
            goal: "compile the weekly report".into(),
            creator: ActorRef::user("alice").unwrap(),
            correlation_id: None,
        })
        .await
        .unwrap()
        .run_id
}

#[tokio::test]
async fn claim_start_complete_release_happy_path() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;

    let claims = kernel.claim_runs(Some(workspace), "worker-a", 5).await.unwrap();
    assert_eq!(claims.len(), 1);
    let claim = &claims[0];
    assert_eq!(claim.run_id, run_id);

    let run = kernel
        .start_run(run_id, worker(), &claim.claim_token)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let step_id = kernel
        .add_step(run_id, "gather inputs".into(), worker())
        .await
        .unwrap();
    kernel
        .add_artifact(
            run_id,
            Some(step_id),
            "report".into(),
            "evidence://bundle/1".into(),
            worker(),
        )
        .await
        .unwrap();

    let run = kernel
        .complete_run(run_id, "evidence://bundle/1", worker(), &claim.claim_token)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.claim_token.is_none());

    kernel
        .release_run(run_id, &claim.claim_token, ReleaseState::Completed, worker())
        .await
        .unwrap();

    // Children preserved the run's correlation id.
    let steps = reads::steps_for_run(kernel.pool(), run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].correlation_id, run.correlation_id);
}

#[tokio::test]
async fn second_claimer_gets_nothing() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    queued_run(&kernel, workspace).await;

    let first = kernel.claim_runs(Some(workspace), "worker-a", 5).await.unwrap();
    assert_eq!(first.len(), 1);
    let second = kernel.claim_runs(Some(workspace), "worker-b", 5).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn stale_lease_is_reclaimable_and_late_heartbeat_loses() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;

    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    let stale_token = claims[0].claim_token.clone();

    // Worker A goes silent past the lease.
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let reclaimed = kernel.claim_runs(Some(workspace), "worker-b", 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].run_id, run_id);

    let err = kernel.heartbeat(run_id, &stale_token).await.unwrap_err();
    assert!(matches!(err, KernelError::LeaseLost));

    // Worker B's lease is intact.
    let outcome = kernel.heartbeat(run_id, &reclaimed[0].claim_token).await.unwrap();
    assert!(matches!(
        outcome,
        HeartbeatOutcome::Renewed { .. } | HeartbeatOutcome::Throttled { .. }
    ));
}

#[tokio::test]
async fn rapid_heartbeats_are_throttled_not_rejected() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    let token = &claims[0].claim_token;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let first = kernel.heartbeat(run_id, token).await.unwrap();
    assert!(matches!(first, HeartbeatOutcome::Renewed { .. }));

    let second = kernel.heartbeat(run_id, token).await.unwrap();
    assert!(matches!(second, HeartbeatOutcome::Throttled { .. }));
}

#[tokio::test]
async fn sweeper_requeues_expired_claims() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2200)).await;
    let reclaimed = kernel.sweep_expired_leases().await.unwrap();
    assert_eq!(reclaimed, vec![run_id]);

    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.claim_token.is_none());

    // The reclamation left an auditable event behind.
    let events = kernel
        .store()
        .query(EventFilter { run_id: Some(run_id), ..Default::default() })
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "run.lease_expired"));
}

#[tokio::test]
async fn completion_without_evidence_is_rejected() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    let token = &claims[0].claim_token;
    kernel.start_run(run_id, worker(), token).await.unwrap();

    let err = kernel
        .complete_run(run_id, "  ", worker(), token)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::EvidenceRequired));

    // The run is still running and the claim still live.
    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.claim_token.is_some());

    // Releasing as completed without the terminal event is also rejected.
    let err = kernel
        .release_run(run_id, token, ReleaseState::Completed, worker())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::EvidenceRequired));
}

#[tokio::test]
async fn completion_without_claim_is_rejected() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    kernel.start_run(run_id, worker(), &claims[0].claim_token).await.unwrap();

    let err = kernel
        .complete_run(run_id, "evidence://x", worker(), "forged-token")
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::LeaseLost));
}

#[tokio::test]
async fn terminal_runs_absorb_further_transitions() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    let token = &claims[0].claim_token;
    kernel.start_run(run_id, worker(), token).await.unwrap();
    kernel
        .complete_run(run_id, "evidence://done", worker(), token)
        .await
        .unwrap();

    let err = kernel
        .cancel_run(run_id, None, ActorRef::user("alice").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidState(_)));

    let err = kernel
        .add_step(run_id, "late step".into(), worker())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidState(_)));
}

#[tokio::test]
async fn released_run_is_claimable_again() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();

    kernel
        .release_run(run_id, &claims[0].claim_token, ReleaseState::Released, worker())
        .await
        .unwrap();

    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.claim_token.is_none());

    let again = kernel.claim_runs(Some(workspace), "worker-b", 1).await.unwrap();
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn approval_request_and_double_decide() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();

    let approval = kernel
        .request_approval(ApprovalRequest {
            workspace_id: workspace,
            room_id: None,
            action: "external.write".into(),
            scope: ApprovalScope::Workspace,
            requester: ActorRef::agent("requester").unwrap(),
            context: None,
        })
        .await
        .unwrap();
    assert_eq!(approval.status, ApprovalStatus::Pending);

    let decided = kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Approved,
                decider: ActorRef::user("carol").unwrap(),
                comment: Some("looks safe".into()),
                expires_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(decided.status, ApprovalStatus::Approved);

    let err = kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Denied,
                decider: ActorRef::user("dave").unwrap(),
                comment: None,
                expires_at: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::AlreadyDecided));
}

#[tokio::test]
async fn held_approvals_can_still_be_decided() {
    let kernel = kernel().await;
    let approval = kernel
        .request_approval(ApprovalRequest {
            workspace_id: Uuid::new_v4(),
            room_id: None,
            action: "external.write".into(),
            scope: ApprovalScope::Workspace,
            requester: ActorRef::agent("requester").unwrap(),
            context: None,
        })
        .await
        .unwrap();

    let held = kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Held,
                decider: ActorRef::user("carol").unwrap(),
                comment: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(held.status, ApprovalStatus::Held);

    let denied = kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Denied,
                decider: ActorRef::user("carol").unwrap(),
                comment: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(denied.status, ApprovalStatus::Denied);
}

#[tokio::test]
async fn external_write_flow_records_negative_decision_events() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let request = ActionRequest {
        action: "external.write".into(),
        actor: ActorRef::agent("writer").unwrap(),
        principal_id: None,
        workspace_id: Some(workspace),
        room_id: None,
        run_id: None,
        zone: Zone::Supervised,
        capability_token_id: None,
        context: None,
    };

    let decision = kernel.evaluate_policy(request.clone()).await.unwrap();
    assert_eq!(decision.decision, DecisionKind::RequireApproval);
    assert_eq!(decision.reason_code, ReasonCode::ExternalWriteRequiresApproval);

    // The negative decision landed on the workspace stream.
    let events = kernel
        .store()
        .query(EventFilter {
            stream_type: Some(aegis_types::StreamType::Workspace),
            stream_id: Some(workspace),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "policy.requires_approval"));

    // Approve at workspace scope; the retry is allowed.
    let approval = kernel
        .request_approval(ApprovalRequest {
            workspace_id: workspace,
            room_id: None,
            action: "external.write".into(),
            scope: ApprovalScope::Workspace,
            requester: ActorRef::agent("writer").unwrap(),
            context: None,
        })
        .await
        .unwrap();
    kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Approved,
                decider: ActorRef::user("carol").unwrap(),
                comment: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();

    let decision = kernel.evaluate_policy(request.clone()).await.unwrap();
    assert_eq!(decision.decision, DecisionKind::Allow);
    assert_eq!(decision.reason_code, ReasonCode::ApprovalAllowsAction);

    // Kill switch overrides the standing approval.
    kernel.gate().set_kill_switch(true);
    let decision = kernel.evaluate_policy(request).await.unwrap();
    assert_eq!(decision.decision, DecisionKind::Deny);
    assert_eq!(decision.reason_code, ReasonCode::KillSwitchActive);
}

#[tokio::test]
async fn live_tail_resumes_without_loss_or_duplication() {
    let kernel = kernel().await;
    let workspace = Uuid::new_v4();
    let alice = ActorRef::user("alice").unwrap();
    let room_id = kernel
        .create_room(workspace, "ops".into(), alice.clone())
        .await
        .unwrap();
    let thread_id = kernel
        .create_thread(room_id, "deploys".into(), alice.clone())
        .await
        .unwrap();
    for i in 0..3 {
        kernel
            .post_message(room_id, thread_id, format!("m{i}"), alice.clone(), None)
            .await
            .unwrap();
    }

    // Resume from seq 2: expect 3,4,5 then live events.
    let mut tail = kernel.tail_room(room_id, 2).await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(tail.recv().await.unwrap().stream_seq);
    }
    assert_eq!(seen, vec![3, 4, 5]);

    kernel
        .post_message(room_id, thread_id, "live one".into(), alice, None)
        .await
        .unwrap();
    let live = tail.recv().await.unwrap();
    assert_eq!(live.stream_seq, 6);
    assert_eq!(live.event_type, "message.posted");
}
