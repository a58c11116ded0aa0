//! Projection rebuild: truncate-and-replay converges with the
//! incrementally maintained state.

use aegis_integration_tests::{queued_run, service, test_kernel, user};
use aegis_kernel::ReleaseState;
use aegis_projection::reads;
use aegis_store_core::{EventFilter, EventStore};
use aegis_types::RunStatus;
use uuid::Uuid;

#[tokio::test]
async fn rebuild_converges_after_a_full_run_lifecycle() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let alice = user("alice");

    // A conversation plus a complete run lifecycle.
    let room_id = kernel.create_room(workspace, "ops".into(), alice.clone()).await.unwrap();
    let thread_id = kernel
        .create_thread(room_id, "work".into(), alice.clone())
        .await
        .unwrap();
    kernel
        .post_message(room_id, thread_id, "kick off".into(), alice.clone(), None)
        .await
        .unwrap();

    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();
    let token = &claims[0].claim_token;
    kernel.start_run(run_id, service("worker-a"), token).await.unwrap();
    let step_id = kernel
        .add_step(run_id, "produce artifact".into(), service("worker-a"))
        .await
        .unwrap();
    kernel
        .add_tool_call(
            run_id,
            Some(step_id),
            "renderer".into(),
            serde_json::json!({"format": "pdf"}),
            service("worker-a"),
        )
        .await
        .unwrap();
    kernel
        .add_artifact(
            run_id,
            Some(step_id),
            "report".into(),
            "evidence://bundle/42".into(),
            service("worker-a"),
        )
        .await
        .unwrap();
    kernel
        .complete_run(run_id, "evidence://bundle/42", service("worker-a"), token)
        .await
        .unwrap();
    kernel
        .release_run(run_id, token, ReleaseState::Completed, service("worker-a"))
        .await
        .unwrap();

    // Snapshot incremental state.
    let run_before = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    let steps_before = reads::steps_for_run(kernel.pool(), run_id).await.unwrap();
    let rooms_before = reads::list_rooms(kernel.pool()).await.unwrap();
    let messages_before = reads::messages_for_thread(kernel.pool(), thread_id).await.unwrap();

    // Truncate everything and replay from sequence 1.
    kernel.rebuild_projections().await.unwrap();

    let run_after = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run_after.status, RunStatus::Succeeded);
    assert_eq!(run_after.status, run_before.status);
    assert_eq!(run_after.goal, run_before.goal);
    assert_eq!(run_after.correlation_id, run_before.correlation_id);
    assert_eq!(run_after.evidence_ref, run_before.evidence_ref);
    assert_eq!(run_after.claim_token, None);

    let steps_after = reads::steps_for_run(kernel.pool(), run_id).await.unwrap();
    assert_eq!(steps_after.len(), steps_before.len());
    assert_eq!(steps_after[0].step_id, steps_before[0].step_id);
    assert_eq!(steps_after[0].correlation_id, run_after.correlation_id);

    assert_eq!(reads::list_rooms(kernel.pool()).await.unwrap().len(), rooms_before.len());
    assert_eq!(
        reads::messages_for_thread(kernel.pool(), thread_id).await.unwrap().len(),
        messages_before.len()
    );
}

#[tokio::test]
async fn rebuild_restores_live_claims_from_claim_events() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();

    kernel.rebuild_projections().await.unwrap();

    // Ownership is reconstructed exactly from the run.claimed event.
    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.claim_token.as_deref(), Some(claims[0].claim_token.as_str()));
    assert_eq!(run.claimed_by_actor_id.as_deref(), Some("worker-a"));
    assert_eq!(run.lease_expires_at, Some(claims[0].lease_expires_at));

    // The chain over the whole history stays intact.
    let events = kernel
        .store()
        .query(EventFilter { run_id: Some(run_id), ..Default::default() })
        .await
        .unwrap();
    assert!(!events.is_empty());
}

#[tokio::test]
async fn exactly_once_holds_for_every_projector_and_event() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();

    let events = kernel
        .store()
        .query(EventFilter { run_id: Some(run_id), ..Default::default() })
        .await
        .unwrap();
    for event in &events {
        for projector in ["conversations", "approvals", "runs"] {
            let count = kernel
                .projections()
                .applied_count(projector, event.event_id)
                .await
                .unwrap();
            assert_eq!(count, 1, "{projector} applied {} times", count);
        }
    }
}
