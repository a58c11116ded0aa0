//! The tamper-evident hash chain.
//!
//! `event_hash = SHA-256(canonical(envelope) || prev_event_hash_bytes)`,
//! emitted as lowercase hex, with an empty previous-hash contribution for
//! the first event of a stream. Verification re-walks a stream in sequence
//! order and stops at the first violation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::canonical_envelope;
use crate::EventEnvelope;

/// Compute the chain hash for an envelope.
///
/// The envelope's own `event_hash` field is ignored; its `prev_event_hash`
/// must already be set to the linked value (or `None` at sequence 1).
pub fn compute_event_hash(envelope: &EventEnvelope) -> String {
    let canonical = canonical_envelope(envelope);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    if let Some(prev) = &envelope.prev_event_hash {
        hasher.update(prev.as_bytes());
    }
    hex::encode(hasher.finalize())
}

//─────────────────────────────
//  Verification
//─────────────────────────────

/// A single violation found while verifying a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainViolation {
    /// The sequence numbers are not dense from 1.
    SequenceGap {
        /// The sequence number that was expected.
        expected: u64,
        /// The sequence number that was found.
        found: u64,
    },
    /// `prev_event_hash` does not equal the prior event's `event_hash`.
    PrevHashMismatch {
        /// The sequence at which the linkage broke.
        stream_seq: u64,
    },
    /// Recomputing the event's hash produced a different value.
    EventHashMismatch {
        /// The sequence at which the recomputation diverged.
        stream_seq: u64,
    },
}

impl std::fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected {expected}, found {found}")
            }
            Self::PrevHashMismatch { stream_seq } => {
                write!(f, "prev hash mismatch at seq {stream_seq}")
            }
            Self::EventHashMismatch { stream_seq } => {
                write!(f, "event hash mismatch at seq {stream_seq}")
            }
        }
    }
}

/// The outcome of verifying one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    /// Number of events inspected before stopping.
    pub checked: u64,
    /// The first violation, if any. `None` means the stream is intact.
    pub violation: Option<ChainViolation>,
}

impl ChainReport {
    /// Returns `true` when no violation was found.
    pub fn is_valid(&self) -> bool {
        self.violation.is_none()
    }
}

/// Verify an ordered slice of events belonging to one stream.
///
/// The slice must start at sequence 1. Verification halts at the first
/// violation; events after it are not inspected.
pub fn verify_events(events: &[EventEnvelope]) -> ChainReport {
    let mut prev_hash: Option<&str> = None;
    for (index, event) in events.iter().enumerate() {
        let expected_seq = index as u64 + 1;
        if event.stream_seq != expected_seq {
            return ChainReport {
                checked: index as u64,
                violation: Some(ChainViolation::SequenceGap {
                    expected: expected_seq,
                    found: event.stream_seq,
                }),
            };
        }
        if event.prev_event_hash.as_deref() != prev_hash {
            return ChainReport {
                checked: index as u64,
                violation: Some(ChainViolation::PrevHashMismatch {
                    stream_seq: event.stream_seq,
                }),
            };
        }
        if compute_event_hash(event) != event.event_hash {
            return ChainReport {
                checked: index as u64,
                violation: Some(ChainViolation::EventHashMismatch {
                    stream_seq: event.stream_seq,
                }),
            };
        }
        prev_hash = Some(event.event_hash.as_str());
    }
    ChainReport { checked: events.len() as u64, violation: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{ActorKind, ActorRef, RedactionLevel, StreamRef, Zone};
    use serde_json::json;
    use uuid::Uuid;

    fn chained_events(n: u64) -> Vec<EventEnvelope> {
        let stream = StreamRef::room(Uuid::nil());
        let mut events = Vec::new();
        let mut prev_hash: Option<String> = None;
        for seq in 1..=n {
            let mut envelope = EventEnvelope {
                event_id: Uuid::new_v4(),
                event_type: "message.posted".to_string(),
                event_version: 1,
                occurred_at: "2026-03-01T09:30:00.000Z".parse().unwrap(),
                workspace_id: None,
                room_id: Some(Uuid::nil()),
                thread_id: None,
                run_id: None,
                step_id: None,
                actor: ActorRef { kind: ActorKind::User, id: "alice".into() },
                actor_principal_id: None,
                zone: Zone::Supervised,
                stream,
                stream_seq: seq,
                correlation_id: Uuid::nil(),
                causation_id: None,
                redaction_level: RedactionLevel::None,
                contains_secrets: false,
                policy_ctx: None,
                model_ctx: None,
                display_ctx: None,
                data: json!({"body": format!("message {seq}")}),
                idempotency_key: None,
                prev_event_hash: prev_hash.clone(),
                event_hash: String::new(),
            };
            envelope.event_hash = compute_event_hash(&envelope);
            prev_hash = Some(envelope.event_hash.clone());
            events.push(envelope);
        }
        events
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let events = chained_events(1);
        let hash = &events[0].event_hash;
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_depends_on_previous_hash() {
        let events = chained_events(2);
        let mut orphan = events[1].clone();
        orphan.prev_event_hash = None;
        assert_ne!(compute_event_hash(&orphan), events[1].event_hash);
    }

    #[test]
    fn intact_chain_verifies() {
        let events = chained_events(5);
        let report = verify_events(&events);
        assert!(report.is_valid());
        assert_eq!(report.checked, 5);
    }

    #[test]
    fn tampered_payload_is_detected_at_its_sequence() {
        let mut events = chained_events(5);
        events[2].data = json!({"body": "rewritten history"});
        let report = verify_events(&events);
        assert_eq!(
            report.violation,
            Some(ChainViolation::EventHashMismatch { stream_seq: 3 })
        );
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn missing_event_is_reported_as_a_gap() {
        let mut events = chained_events(4);
        events.remove(1);
        let report = verify_events(&events);
        assert_eq!(
            report.violation,
            Some(ChainViolation::SequenceGap { expected: 2, found: 3 })
        );
    }

    #[test]
    fn relinked_chain_fails_prev_hash_check() {
        let mut events = chained_events(3);
        events[2].prev_event_hash = Some("0".repeat(64));
        let report = verify_events(&events);
        assert_eq!(
            report.violation,
            Some(ChainViolation::PrevHashMismatch { stream_seq: 3 })
        );
    }

    #[test]
    fn empty_stream_is_valid() {
        assert!(verify_events(&[]).is_valid());
    }
}
