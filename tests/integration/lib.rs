//! Shared helpers for the Aegis integration suite.

use std::sync::Arc;
use std::time::Duration;

use aegis_kernel::{CreateRun, Kernel, KernelConfig};
use aegis_store_sqlite::SqliteEventStore;
use aegis_types::ActorRef;
use uuid::Uuid;

/// A kernel over in-memory SQLite with short leases, suitable for tests
/// that exercise expiry.
pub async fn test_kernel() -> Arc<Kernel> {
    test_kernel_with(KernelConfig {
        lease_duration: Duration::from_secs(2),
        heartbeat_min_interval: Duration::from_millis(100),
        max_claim_age: Duration::from_secs(30),
        ..Default::default()
    })
    .await
}

/// A kernel with explicit lease configuration.
pub async fn test_kernel_with(config: KernelConfig) -> Arc<Kernel> {
    let store = Arc::new(SqliteEventStore::in_memory().await.expect("in-memory store"));
    Arc::new(Kernel::new(store, config).await.expect("kernel assembly"))
}

/// A human actor for test requests.
pub fn user(id: &str) -> ActorRef {
    ActorRef::user(id).expect("valid actor id")
}

/// An agent actor for test requests.
pub fn agent(id: &str) -> ActorRef {
    ActorRef::agent(id).expect("valid actor id")
}

/// A worker-service actor for test requests.
pub fn service(id: &str) -> ActorRef {
    ActorRef::service(id).expect("valid actor id")
}

/// Create a queued run and return its id.
pub async fn queued_run(kernel: &Kernel, workspace_id: Uuid) -> Uuid {
    kernel
        .create_run(CreateRun {
            workspace_id,
            room_id: None,
            goal: "integration test run".into(),
            creator: user("alice"),
            correlation_id: None,
        })
        .await
        .expect("run creation")
        .run_id
}
