//! Concurrency races: claimers, deciders, and stale heartbeats.

use aegis_integration_tests::{agent, queued_run, test_kernel, user};
use aegis_kernel::{ApprovalRequest, DecideOutcome, KernelError};
use aegis_projection::reads;
use aegis_types::{ApprovalScope, ApprovalStatus};
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claimers_cannot_share_a_run() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    queued_run(&kernel, workspace).await;

    let mut handles = Vec::new();
    for worker in ["worker-a", "worker-b", "worker-c", "worker-d"] {
        let kernel = kernel.clone();
        handles.push(tokio::spawn(async move {
            kernel.claim_runs(Some(workspace), worker, 1).await.unwrap()
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().len();
    }
    // Exactly one claimer obtained the run; the others saw zero rows.
    assert_eq!(total, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claimers_split_a_batch_without_overlap() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    for _ in 0..6 {
        queued_run(&kernel, workspace).await;
    }

    let mut handles = Vec::new();
    for worker in ["worker-a", "worker-b", "worker-c"] {
        let kernel = kernel.clone();
        handles.push(tokio::spawn(async move {
            kernel.claim_runs(Some(workspace), worker, 4).await.unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0;
    for handle in handles {
        for claim in handle.await.unwrap() {
            assert!(seen.insert(claim.run_id), "run claimed twice");
            total += 1;
        }
    }
    assert_eq!(total, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_deciders_one_wins_one_sees_already_decided() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let approval = kernel
        .request_approval(ApprovalRequest {
            workspace_id: workspace,
            room_id: None,
            action: "external.write".into(),
            scope: ApprovalScope::Workspace,
            requester: agent("requester"),
            context: None,
        })
        .await
        .unwrap();

    let approve = {
        let kernel = kernel.clone();
        let approval_id = approval.approval_id;
        tokio::spawn(async move {
            kernel
                .decide_approval(
                    approval_id,
                    DecideOutcome {
                        outcome: ApprovalStatus::Approved,
                        decider: user("carol"),
                        comment: None,
                        expires_at: None,
                    },
                )
                .await
        })
    };
    let deny = {
        let kernel = kernel.clone();
        let approval_id = approval.approval_id;
        tokio::spawn(async move {
            kernel
                .decide_approval(
                    approval_id,
                    DecideOutcome {
                        outcome: ApprovalStatus::Denied,
                        decider: user("dave"),
                        comment: None,
                        expires_at: None,
                    },
                )
                .await
        })
    };

    let results = [approve.await.unwrap(), deny.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let losses = results
        .iter()
        .filter(|r| matches!(r, Err(KernelError::AlreadyDecided)))
        .count();
    assert_eq!((wins, losses), (1, 1));

    // The surviving status matches the winning decider.
    let row = reads::approval_by_id(kernel.pool(), approval.approval_id)
        .await
        .unwrap()
        .unwrap();
    assert!(row.status.is_terminal());
    let winner = results.iter().flatten().next().unwrap();
    assert_eq!(row.status, winner.status);
    assert_eq!(row.decided_by, winner.decided_by);
}

#[tokio::test]
async fn stale_token_heartbeat_leaves_run_sweepable() {
    let kernel = test_kernel().await;
    let workspace = Uuid::new_v4();
    let run_id = queued_run(&kernel, workspace).await;
    let claims = kernel.claim_runs(Some(workspace), "worker-a", 1).await.unwrap();

    let err = kernel.heartbeat(run_id, "not-the-token").await.unwrap_err();
    assert!(matches!(err, KernelError::LeaseLost));

    // The real claim is unaffected by the stale heartbeat.
    let run = reads::run_by_id(kernel.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.claim_token.as_deref(), Some(claims[0].claim_token.as_str()));

    // Once expired, the sweeper reclaims it despite the earlier bad beat.
    tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
    let reclaimed = kernel.sweep_expired_leases().await.unwrap();
    assert_eq!(reclaimed, vec![run_id]);
}
