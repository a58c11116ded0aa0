#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-store-memory** – In-memory event-store driver for Aegis.
//!
//! This crate provides a fast, non-persistent store suitable for testing,
//! development, and scenarios where durability is not required. All data is
//! lost when the process terminates. The append pipeline (principal
//! resolution, secret scan, sequencing, hash chaining, idempotent replay)
//! matches the durable drivers exactly, so store-level tests written against
//! it hold for the SQLite driver too.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use aegis_store_core::{
    chain::compute_event_hash, verify_events, AppendReceipt, ChainReport, EventEnvelope,
    EventFilter, EventId, EventStore, MarkerScanner, NewEvent, ScanOutcome, SecretPolicy,
    SecretScanner, StoreError,
};
use aegis_types::{RedactionLevel, StreamRef, StreamType, Zone};

/// Default buffer size for the live event broadcast channel.
const DEFAULT_BUFFER: usize = 1024;

type StreamKey = (StreamType, Uuid);

#[derive(Default)]
struct Inner {
    streams: HashMap<StreamKey, Vec<EventEnvelope>>,
    by_id: HashMap<EventId, (StreamKey, usize)>,
    idempotency: HashMap<(StreamType, Uuid, String), EventId>,
    principals: HashMap<String, Uuid>,
}

/// An in-memory, non-persistent event store.
pub struct MemoryEventStore {
    inner: Arc<RwLock<Inner>>,
    broadcast_tx: broadcast::Sender<EventEnvelope>,
    scanner: Arc<dyn SecretScanner>,
    secret_policy: SecretPolicy,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    /// Creates a new, empty store with the default broadcast buffer.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Creates a store with a custom broadcast buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(buffer_size);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            broadcast_tx,
            scanner: Arc::new(MarkerScanner::new()),
            secret_policy: SecretPolicy::Annotate,
        }
    }

    /// Replace the secret scanner and policy.
    pub fn with_secret_handling(
        mut self,
        scanner: Arc<dyn SecretScanner>,
        policy: SecretPolicy,
    ) -> Self {
        self.scanner = scanner;
        self.secret_policy = policy;
        self
    }

    /// Total number of stored events across all streams.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    /// Drop every event, head, and principal. Useful between tests.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.streams.clear();
        inner.by_id.clear();
        inner.idempotency.clear();
        inner.principals.clear();
    }

    fn resolve_principal(inner: &mut Inner, actor_id: &str) -> Uuid {
        *inner
            .principals
            .entry(actor_id.to_string())
            .or_insert_with(Uuid::new_v4)
    }

    fn seal(
        new_event: &NewEvent,
        stream_seq: u64,
        prev_event_hash: Option<String>,
        principal: Uuid,
        contains_secrets: bool,
        redaction_level: RedactionLevel,
    ) -> EventEnvelope {
        let mut envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: new_event.event_type.clone(),
            event_version: new_event.event_version,
            occurred_at: aegis_store_core::canonical::truncate_to_millis(new_event.occurred_at),
            workspace_id: new_event.workspace_id,
            room_id: new_event.room_id,
            thread_id: new_event.thread_id,
            run_id: new_event.run_id,
            step_id: new_event.step_id,
            actor: new_event.actor.clone(),
            actor_principal_id: Some(principal),
            zone: new_event.zone.unwrap_or(Zone::Supervised),
            stream: new_event.stream,
            stream_seq,
            correlation_id: new_event.correlation_id,
            causation_id: new_event.causation_id,
            redaction_level,
            contains_secrets,
            policy_ctx: new_event.policy_ctx.clone(),
            model_ctx: new_event.model_ctx.clone(),
            display_ctx: new_event.display_ctx.clone(),
            data: new_event.data.clone(),
            idempotency_key: new_event.idempotency_key.clone(),
            prev_event_hash,
            event_hash: String::new(),
        };
        envelope.event_hash = compute_event_hash(&envelope);
        envelope
    }

    fn push(inner: &mut Inner, envelope: EventEnvelope) {
        let key = (envelope.stream.stream_type, envelope.stream.stream_id);
        if let Some(idem) = &envelope.idempotency_key {
            inner
                .idempotency
                .insert((key.0, key.1, idem.clone()), envelope.event_id);
        }
        let entries = inner.streams.entry(key).or_default();
        inner.by_id.insert(envelope.event_id, (key, entries.len()));
        entries.push(envelope);
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, new_event: NewEvent) -> Result<AppendReceipt, StoreError> {
        new_event.validate()?;

        // The write lock serializes appenders, which is the in-memory
        // equivalent of the SQLite driver's single-writer transaction.
        let mut inner = self.inner.write().await;
        let key = (new_event.stream.stream_type, new_event.stream.stream_id);

        if let Some(idem) = &new_event.idempotency_key {
            if let Some(existing_id) = inner.idempotency.get(&(key.0, key.1, idem.clone())) {
                let (stream_key, index) = inner.by_id[existing_id];
                let existing = inner.streams[&stream_key][index].clone();
                return Ok(AppendReceipt { event: existing, replayed: true });
            }
        }

        let scan = self.scanner.scan(&new_event.data);
        let (contains_secrets, redaction_level) =
            apply_secret_policy(&scan, self.secret_policy, new_event.redaction_level)?;

        let principal = Self::resolve_principal(&mut inner, &new_event.actor.id);
        let entries = inner.streams.entry(key).or_default();
        let stream_seq = entries.len() as u64 + 1;
        let prev_event_hash = entries.last().map(|e| e.event_hash.clone());

        let envelope = Self::seal(
            &new_event,
            stream_seq,
            prev_event_hash,
            principal,
            contains_secrets,
            redaction_level,
        );
        Self::push(&mut inner, envelope.clone());

        let mut committed = vec![envelope.clone()];
        if contains_secrets {
            let aux = NewEvent {
                event_type: "secret.detected".to_string(),
                event_version: 1,
                occurred_at: new_event.occurred_at,
                data: serde_json::json!({
                    "source_event_id": envelope.event_id,
                    "markers": scan.markers,
                }),
                idempotency_key: None,
                causation_id: Some(envelope.event_id),
                redaction_level: RedactionLevel::None,
                ..new_event.clone()
            };
            let entries = inner.streams.entry(key).or_default();
            let seq = entries.len() as u64 + 1;
            let prev = entries.last().map(|e| e.event_hash.clone());
            let aux_envelope =
                Self::seal(&aux, seq, prev, principal, false, RedactionLevel::None);
            Self::push(&mut inner, aux_envelope.clone());
            committed.push(aux_envelope);
        }
        drop(inner);

        for event in committed {
            // Ignore lagging receiver errors - subscribers handle misses.
            let _ = self.broadcast_tx.send(event);
        }
        Ok(AppendReceipt { event: envelope, replayed: false })
    }

    async fn read_stream(
        &self,
        stream: StreamRef,
        from_seq: u64,
        limit: Option<u64>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let inner = self.inner.read().await;
        let key = (stream.stream_type, stream.stream_id);
        let mut events: Vec<EventEnvelope> = inner
            .streams
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.stream_seq > from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(limit) = limit {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    async fn head_seq(&self, stream: StreamRef) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        let key = (stream.stream_type, stream.stream_id);
        Ok(inner.streams.get(&key).map(|e| e.len() as u64).unwrap_or(0))
    }

    async fn event_by_id(&self, event_id: EventId) -> Result<Option<EventEnvelope>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .get(&event_id)
            .map(|(key, index)| inner.streams[key][*index].clone()))
    }

    async fn query(&self, filter: EventFilter) -> Result<Vec<EventEnvelope>, StoreError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<&StreamKey> = inner.streams.keys().collect();
        keys.sort_by_key(|(stream_type, id)| (stream_type.as_str(), *id));

        let mut out = Vec::new();
        for key in keys {
            if let Some(stream_type) = filter.stream_type {
                if key.0 != stream_type {
                    continue;
                }
            }
            if let Some(stream_id) = filter.stream_id {
                if key.1 != stream_id {
                    continue;
                }
            }
            for event in &inner.streams[key] {
                if let Some(from_seq) = filter.from_seq {
                    if event.stream_seq <= from_seq {
                        continue;
                    }
                }
                if let Some(run_id) = filter.run_id {
                    if event.run_id != Some(run_id) {
                        continue;
                    }
                }
                if let Some(correlation_id) = filter.correlation_id {
                    if event.correlation_id != correlation_id {
                        continue;
                    }
                }
                out.push(event.clone());
            }
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.broadcast_tx.subscribe()
    }

    async fn verify_stream(&self, stream: StreamRef) -> Result<ChainReport, StoreError> {
        let events = self.read_stream(stream, 0, None).await?;
        Ok(verify_events(&events))
    }
}

fn apply_secret_policy(
    scan: &ScanOutcome,
    policy: SecretPolicy,
    requested: RedactionLevel,
) -> Result<(bool, RedactionLevel), StoreError> {
    if scan.is_clean() {
        return Ok((false, requested));
    }
    match policy {
        SecretPolicy::Annotate => Ok((true, RedactionLevel::Masked)),
        SecretPolicy::Reject => Err(StoreError::SecretDetected(scan.markers.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::ActorRef;
    use serde_json::json;

    fn new_event(stream: StreamRef, body: &str) -> NewEvent {
        NewEvent::new(
            "message.posted",
            stream,
            ActorRef::user("alice").unwrap(),
            json!({"body": body}),
        )
    }

    #[tokio::test]
    async fn sequences_are_dense_and_chained() {
        let store = MemoryEventStore::new();
        let stream = StreamRef::room(Uuid::new_v4());
        for i in 0..5 {
            store.append(new_event(stream, &format!("m{i}"))).await.unwrap();
        }
        let events = store.read_stream(stream, 0, None).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.stream_seq, i as u64 + 1);
        }
        assert!(store.verify_stream(stream).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn idempotent_replay_returns_the_existing_event() {
        let store = MemoryEventStore::new();
        let stream = StreamRef::room(Uuid::new_v4());
        let first = store
            .append(new_event(stream, "once").idempotent("K"))
            .await
            .unwrap();
        assert!(!first.replayed);
        let second = store
            .append(new_event(stream, "once again").idempotent("K"))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(first.event.event_id, second.event.event_id);
        assert_eq!(first.event.stream_seq, second.event.stream_seq);
        assert_eq!(store.head_seq(stream).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn principal_resolution_is_stable_per_actor() {
        let store = MemoryEventStore::new();
        let stream = StreamRef::room(Uuid::new_v4());
        let a = store.append(new_event(stream, "one")).await.unwrap();
        let b = store.append(new_event(stream, "two")).await.unwrap();
        assert_eq!(a.event.actor_principal_id, b.event.actor_principal_id);
        assert!(a.event.actor_principal_id.is_some());
    }

    #[tokio::test]
    async fn secret_annotation_appends_an_auxiliary_event() {
        let store = MemoryEventStore::new();
        let stream = StreamRef::room(Uuid::new_v4());
        let receipt = store
            .append(new_event(stream, "token is sk-live-deadbeef"))
            .await
            .unwrap();
        assert!(receipt.event.contains_secrets);
        assert_eq!(receipt.event.redaction_level, RedactionLevel::Masked);

        let events = store.read_stream(stream, 0, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "secret.detected");
        assert_eq!(events[1].causation_id, Some(receipt.event.event_id));
        assert!(store.verify_stream(stream).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn secret_rejection_refuses_the_append() {
        let store = MemoryEventStore::new().with_secret_handling(
            Arc::new(MarkerScanner::new()),
            SecretPolicy::Reject,
        );
        let stream = StreamRef::room(Uuid::new_v4());
        let err = store
            .append(new_event(stream, "ghp_verysecret"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SecretDetected(_)));
        assert_eq!(store.head_seq(stream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribers_observe_commit_order() {
        let store = MemoryEventStore::new();
        let mut rx = store.subscribe();
        let stream = StreamRef::room(Uuid::new_v4());
        store.append(new_event(stream, "first")).await.unwrap();
        store.append(new_event(stream, "second")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().stream_seq, 1);
        assert_eq!(rx.recv().await.unwrap().stream_seq, 2);
    }

    #[tokio::test]
    async fn query_filters_by_run_and_correlation() {
        let store = MemoryEventStore::new();
        let stream = StreamRef::room(Uuid::new_v4());
        let run_id = Uuid::new_v4();
        let correlated = new_event(stream, "for the run").for_run(run_id);
        let correlation_id = correlated.correlation_id;
        store.append(correlated).await.unwrap();
        store.append(new_event(stream, "unrelated")).await.unwrap();

        let by_run = store
            .query(EventFilter { run_id: Some(run_id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_run.len(), 1);

        let by_correlation = store
            .query(EventFilter {
                correlation_id: Some(correlation_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_correlation.len(), 1);
        assert_eq!(by_correlation[0].run_id, Some(run_id));
    }
}
