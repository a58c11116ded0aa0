//! Property-based invariants over the event store: sequence density, chain
//! linkage, and the idempotent-append law.

use aegis_store_core::{EventStore, NewEvent};
use aegis_store_memory::MemoryEventStore;
use aegis_store_sqlite::SqliteEventStore;
use aegis_types::{ActorRef, StreamRef};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn arbitrary_body() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ._-]{0,64}"
}

/// Append instructions: each entry is (stream index 0..3, body, optional
/// idempotency key).
fn arbitrary_appends() -> impl Strategy<Value = Vec<(u8, String, Option<u8>)>> {
    prop::collection::vec(
        (0u8..3, arbitrary_body(), prop::option::of(0u8..5)),
        1..40,
    )
}

async fn run_appends(
    store: &dyn EventStore,
    appends: &[(u8, String, Option<u8>)],
) -> Vec<StreamRef> {
    let streams: Vec<StreamRef> = (0..3)
        .map(|i| StreamRef::room(Uuid::from_u128(0x1000 + i)))
        .collect();
    for (stream_index, body, key) in appends {
        let mut event = NewEvent::new(
            "message.posted",
            streams[*stream_index as usize],
            ActorRef::user("prop-user").unwrap(),
            json!({"body": body}),
        );
        if let Some(key) = key {
            event = event.idempotent(format!("k{key}"));
        }
        store.append(event).await.unwrap();
    }
    streams
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Sequences are dense from 1 and the hash chain verifies, for any
    /// interleaving of appends across streams.
    #[test]
    fn sequences_dense_and_chain_valid(appends in arbitrary_appends()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = MemoryEventStore::new();
            let streams = run_appends(&store, &appends).await;
            for stream in streams {
                let events = store.read_stream(stream, 0, None).await.unwrap();
                for (i, event) in events.iter().enumerate() {
                    prop_assert_eq!(event.stream_seq, i as u64 + 1);
                }
                prop_assert!(store.verify_stream(stream).await.unwrap().is_valid());
            }
            Ok(())
        })?;
    }

    /// At most one event exists per (stream, idempotency key), and repeated
    /// appends with the same key return the same event.
    #[test]
    fn idempotency_keys_are_unique_per_stream(appends in arbitrary_appends()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = MemoryEventStore::new();
            let streams = run_appends(&store, &appends).await;
            for stream in streams {
                let events = store.read_stream(stream, 0, None).await.unwrap();
                let mut keys = std::collections::HashSet::new();
                for event in &events {
                    if let Some(key) = &event.idempotency_key {
                        prop_assert!(
                            keys.insert(key.clone()),
                            "duplicate idempotency key {} in stream",
                            key
                        );
                    }
                }
            }
            Ok(())
        })?;
    }

    /// The SQLite driver agrees with the in-memory driver on sequence
    /// assignment and head position for the same append series.
    #[test]
    fn drivers_agree_on_sequencing(appends in arbitrary_appends()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let memory = MemoryEventStore::new();
            let sqlite = SqliteEventStore::in_memory().await.unwrap();
            let streams = run_appends(&memory, &appends).await;
            run_appends(&sqlite, &appends).await;
            for stream in streams {
                let memory_seqs: Vec<u64> = memory
                    .read_stream(stream, 0, None)
                    .await
                    .unwrap()
                    .iter()
                    .map(|e| e.stream_seq)
                    .collect();
                let sqlite_seqs: Vec<u64> = sqlite
                    .read_stream(stream, 0, None)
                    .await
                    .unwrap()
                    .iter()
                    .map(|e| e.stream_seq)
                    .collect();
                prop_assert_eq!(memory_seqs, sqlite_seqs);
                prop_assert_eq!(
                    memory.head_seq(stream).await.unwrap(),
                    sqlite.head_seq(stream).await.unwrap()
                );
            }
            Ok(())
        })?;
    }
}
