//! The end-to-end seed scenarios: external-write approval flow, kill-switch
//! override, idempotent append, tamper detection, lease lifecycle, and
//! evidence gating.

use std::time::Duration;

use aegis_integration_tests::{agent, queued_run, service, test_kernel, user};
use aegis_kernel::{ApprovalRequest, DecideOutcome, KernelError, ReleaseState};
use aegis_policy::ActionRequest;
use aegis_projection::reads;
use aegis_store_core::{ChainViolation, EventStore, NewEvent};
use aegis_types::{
    ApprovalScope, ApprovalStatus, DecisionKind, ReasonCode, RunStatus, StreamRef, Zone,
};
use serde_json::json;
use uuid::Uuid;

fn external_write(workspace: Uuid) -> ActionRequest {
    ActionRequest {
        action: "external.write".into(),
        actor: agent("publisher"),
        principal_id: None,
        workspace_id: Some(workspace),
        room_id: None,
        run_id: None,
        zone: Zone::Supervised,
        capability_token_id: None,
        context: None,
    }
}

#[tokio::test]
async fn scenario_1_external_write_happy_path() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();

    // No approval yet: the request escalates.
    let decision = kernel.evaluate_policy(external_write(workspace)).await.unwrap();
    assert_eq!(decision.decision, DecisionKind::RequireApproval);
    assert_eq!(decision.reason_code, ReasonCode::ExternalWriteRequiresApproval);

    // Create and approve at workspace scope.
    let approval = kernel
        .request_approval(ApprovalRequest {
            workspace_id: workspace,
            room_id: None,
            action: "external.write".into(),
            scope: ApprovalScope::Workspace,
            requester: agent("publisher"),
            context: Some(json!({"target": "blog"})),
        })
        .await
        .unwrap();
    kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Approved,
                decider: user("carol"),
                comment: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();

    // The retry is allowed by the approval.
    let decision = kernel.evaluate_policy(external_write(workspace)).await.unwrap();
    assert_eq!(decision.decision, DecisionKind::Allow);
    assert_eq!(decision.reason_code, ReasonCode::ApprovalAllowsAction);
}

#[tokio::test]
async fn scenario_2_kill_switch_overrides_approval() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();

    let approval = kernel
        .request_approval(ApprovalRequest {
            workspace_id: workspace,
            room_id: None,
            action: "external.write".into(),
            scope: ApprovalScope::Workspace,
            requester: agent("publisher"),
            context: None,
        })
        .await
        .unwrap();
    kernel
        .decide_approval(
            approval.approval_id,
            DecideOutcome {
                outcome: ApprovalStatus::Approved,
                decider: user("carol"),
                comment: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();

    kernel.gate().set_kill_switch(true);
    let decision = kernel.evaluate_policy(external_write(workspace)).await.unwrap();
    assert_eq!(decision.decision, DecisionKind::Deny);
    assert_eq!(decision.reason_code, ReasonCode::KillSwitchActive);
}

#[tokio::test]
async fn scenario_3_idempotent_append() {
    let kernel = test_kernel().await;
    let stream = StreamRef::room(Uuid::new_v4());
    let store = kernel.store();

    let make = || {
        NewEvent::new(
            "message.posted",
            stream,
            user("alice"),
            json!({"message_id": Uuid::new_v4(), "thread_id": Uuid::new_v4(), "body": "hello"}),
        )
        .idempotent("K")
    };

    let first = store.append(make()).await.unwrap();
    let second = store.append(make()).await.unwrap();

    assert_eq!(first.event.event_id, second.event.event_id);
    assert_eq!(first.event.stream_seq, second.event.stream_seq);
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(store.head_seq(stream).await.unwrap(), 1);

    // A different key grows the chain by exactly one.
    store.append(make().idempotent("K2")).await.unwrap();
    assert_eq!(store.head_seq(stream).await.unwrap(), 2);
    assert!(store.verify_stream(stream).await.unwrap().is_valid());
}

#[tokio::test]
async fn scenario_4_tamper_detection_halts_at_the_bad_sequence() {
    let kernel = test_kernel().await;
    let store = kernel.store();
    let stream = StreamRef::room(Uuid::new_v4());
    for i in 0..5 {
        store
            .append(NewEvent::new(
                "message.posted",
                stream,
                user("alice"),
                json!({"body": format!("m{i}")}),
            ))
            .await
            .unwrap();
    }

    // Mutate one row underneath the append-only guard.
    sqlx::query("DROP TRIGGER events_block_update")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE events SET data = '{\"body\":\"forged\"}' WHERE stream_seq = 3")
        .execute(store.pool())
        .await
        .unwrap();

    let report = store.verify_stream(stream).await.unwrap();
    assert_eq!(report.violation, Some(ChainViolation::EventHashMismatch { stream_seq: 3 }));
    assert_eq!(report.checked, 2);
}

#[tokio::test]
async fn scenario_5_claim_heartbeat_expire_lifecycle() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;

    // Worker A claims; worker B gets zero rows inside the lease.
    let a_claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    assert_eq!(a_claims.len(), 1);
    assert!(kernel.claim_runs(Some(workspace), "worker-b", 1).await.unwrap().is_empty());

    // Worker A crashes; after the lease and a sweep, B can claim.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    kernel.sweep_expired_leases().await.unwrap();
    let b_claims = kernel.claim_runs(Some(workspace), "worker-b", 1).await.unwrap();
    assert_eq!(b_claims.len(), 1);

    // A's late heartbeat is rejected; B's lifecycle continues to completion.
    let err = kernel.heartbeat(run_id, &a_claims[0].claim_token).await.unwrap_err();
    assert!(matches!(err, KernelError::LeaseLost));

    let token = &b_claims[0].claim_token;
    kernel.start_run(run_id, service("worker-b"), token).await.unwrap();
    kernel
        .complete_run(run_id, "evidence://bundle/9", service("worker-b"), token)
        .await
        .unwrap();
    kernel
        .release_run(run_id, token, ReleaseState::Completed, service("worker-b"))
        .await
        .unwrap();

    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.evidence_ref.as_deref(), Some("evidence://bundle/9"));
}

#[tokio::test]
async fn scenario_6_evidence_required() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    let token = &claims[0].claim_token;
    kernel.start_run(run_id, service("worker-a"), token).await.unwrap();

    let err = kernel
        .complete_run(run_id, "", service("worker-a"), token)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::EvidenceRequired));
    assert_eq!(err.reason_code(), ReasonCode::EvidenceRequired);

    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
}

#[tokio::test]
async fn live_tail_reconnect_resumes_without_loss_or_duplication() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let alice = user("alice");
    let room_id = kernel.create_room(workspace, "ops".into(), alice.clone()).await.unwrap();
    let thread_id = kernel
        .create_thread(room_id, "status".into(), alice.clone())
        .await
        .unwrap();

    let mut first_session = kernel.tail_room(room_id, 0).await.unwrap();
    for i in 0..4 {
        kernel
            .post_message(room_id, thread_id, format!("m{i}"), alice.clone(), None)
            .await
            .unwrap();
    }

    // Read part of the stream, then "disconnect".
    let mut last_seen = 0;
    for _ in 0..3 {
        last_seen = first_session.recv().await.unwrap().stream_seq;
    }
    drop(first_session);

    // Reconnect from the cursor: everything after it arrives exactly once.
    let mut second_session = kernel.tail_room(room_id, last_seen).await.unwrap();
    let mut seqs = Vec::new();
    for _ in 0..3 {
        seqs.push(second_session.recv().await.unwrap().stream_seq);
    }
    assert_eq!(seqs, vec![last_seen + 1, last_seen + 2, last_seen + 3]);
}
