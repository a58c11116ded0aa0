//! Canonical envelope serialization.
//!
//! Every implementer that hashes envelopes must produce byte-identical
//! output, so the rules here are strict:
//!
//! - map keys in ascending byte order at every nesting level;
//! - timestamps as RFC-3339 UTC with millisecond precision;
//! - absent optional fields omitted, except the semantically nullable
//!   `causation_id` and `prev_event_hash`, which serialize as `null`;
//! - the `event_hash` field itself is never part of the canonical bytes.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::EventEnvelope;

/// Format a timestamp the way the canonical form requires.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate a timestamp to the canonical millisecond precision.
///
/// Drivers apply this before sealing an envelope so that the persisted
/// value, the canonical bytes, and every later read agree exactly.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::DurationRound;
    ts.duration_trunc(chrono::Duration::milliseconds(1))
        .unwrap_or(ts)
}

/// Render any JSON value with keys sorted in ascending byte order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json renders integers plainly and floats via the shortest
        // round-trippable form, both stable across invocations.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("strings always serialize"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // BTreeMap iteration yields keys in ascending byte order.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("strings always serialize"));
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

/// Build the canonical byte form of an envelope, excluding `event_hash`.
///
/// `prev_event_hash` is included in the object (as `null` for the first
/// event of a stream) and *additionally* appended to the hash input by the
/// chain layer; the object-level field binds the linkage into the signed
/// bytes while the appended copy keeps the chain definition independent of
/// JSON encoding.
pub fn canonical_envelope(envelope: &EventEnvelope) -> String {
    let mut fields: BTreeMap<&'static str, Value> = BTreeMap::new();

    fields.insert(
        "actor",
        serde_json::json!({
            "id": envelope.actor.id,
            "kind": envelope.actor.kind.as_str(),
        }),
    );
    if let Some(principal) = envelope.actor_principal_id {
        fields.insert("actor_principal_id", Value::String(principal.to_string()));
    }
    fields.insert(
        "causation_id",
        match envelope.causation_id {
            Some(id) => Value::String(id.to_string()),
            None => Value::Null,
        },
    );
    fields.insert("contains_secrets", Value::Bool(envelope.contains_secrets));
    fields.insert(
        "correlation_id",
        Value::String(envelope.correlation_id.to_string()),
    );
    fields.insert("data", envelope.data.clone());
    if let Some(ctx) = &envelope.display_ctx {
        fields.insert("display_ctx", ctx.clone());
    }
    fields.insert("event_id", Value::String(envelope.event_id.to_string()));
    fields.insert("event_type", Value::String(envelope.event_type.clone()));
    fields.insert("event_version", Value::from(envelope.event_version));
    if let Some(key) = &envelope.idempotency_key {
        fields.insert("idempotency_key", Value::String(key.clone()));
    }
    if let Some(ctx) = &envelope.model_ctx {
        fields.insert("model_ctx", ctx.clone());
    }
    fields.insert(
        "occurred_at",
        Value::String(canonical_timestamp(&envelope.occurred_at)),
    );
    if let Some(ctx) = &envelope.policy_ctx {
        fields.insert("policy_ctx", ctx.clone());
    }
    fields.insert(
        "prev_event_hash",
        match &envelope.prev_event_hash {
            Some(hash) => Value::String(hash.clone()),
            None => Value::Null,
        },
    );
    fields.insert(
        "redaction_level",
        Value::String(envelope.redaction_level.as_str().to_string()),
    );
    if let Some(id) = envelope.room_id {
        fields.insert("room_id", Value::String(id.to_string()));
    }
    if let Some(id) = envelope.run_id {
        fields.insert("run_id", Value::String(id.to_string()));
    }
    if let Some(id) = envelope.step_id {
        fields.insert("step_id", Value::String(id.to_string()));
    }
    fields.insert(
        "stream",
        serde_json::json!({
            "stream_id": envelope.stream.stream_id.to_string(),
            "stream_type": envelope.stream.stream_type.as_str(),
        }),
    );
    fields.insert("stream_seq", Value::from(envelope.stream_seq));
    if let Some(id) = envelope.thread_id {
        fields.insert("thread_id", Value::String(id.to_string()));
    }
    if let Some(id) = envelope.workspace_id {
        fields.insert("workspace_id", Value::String(id.to_string()));
    }
    fields.insert("zone", Value::String(envelope.zone.as_str().to_string()));

    let object: serde_json::Map<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    canonical_json(&Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{ActorKind, ActorRef, RedactionLevel, StreamRef, Zone};
    use serde_json::json;
    use uuid::Uuid;

    fn sample_envelope() -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::nil(),
            event_type: "run.created".to_string(),
            event_version: 1,
            occurred_at: "2026-03-01T12:00:00.123456Z".parse().unwrap(),
            workspace_id: Some(Uuid::nil()),
            room_id: None,
            thread_id: None,
            run_id: Some(Uuid::nil()),
            step_id: None,
            actor: ActorRef { kind: ActorKind::Agent, id: "builder".into() },
            actor_principal_id: None,
            zone: Zone::Supervised,
            stream: StreamRef::workspace(Uuid::nil()),
            stream_seq: 1,
            correlation_id: Uuid::nil(),
            causation_id: None,
            redaction_level: RedactionLevel::None,
            contains_secrets: false,
            policy_ctx: None,
            model_ctx: None,
            display_ctx: None,
            data: json!({"goal": "test", "b": 2, "a": 1}),
            idempotency_key: None,
            prev_event_hash: None,
            event_hash: String::new(),
        }
    }

    #[test]
    fn keys_sort_in_byte_order_at_every_level() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn timestamps_canonicalize_to_millis() {
        let ts: DateTime<Utc> = "2026-03-01T12:00:00.123456Z".parse().unwrap();
        assert_eq!(canonical_timestamp(&ts), "2026-03-01T12:00:00.123Z");
        let ts: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        assert_eq!(canonical_timestamp(&ts), "2026-03-01T12:00:00.000Z");
    }

    #[test]
    fn canonical_form_is_deterministic() {
        let envelope = sample_envelope();
        assert_eq!(canonical_envelope(&envelope), canonical_envelope(&envelope));
    }

    #[test]
    fn nullable_fields_appear_as_null_and_absent_ones_are_omitted() {
        let canonical = canonical_envelope(&sample_envelope());
        assert!(canonical.contains(r#""causation_id":null"#));
        assert!(canonical.contains(r#""prev_event_hash":null"#));
        assert!(!canonical.contains("room_id"));
        assert!(!canonical.contains("policy_ctx"));
        assert!(!canonical.contains("\"event_hash\""));
    }

    #[test]
    fn payload_keys_are_sorted_inside_the_envelope() {
        let canonical = canonical_envelope(&sample_envelope());
        assert!(canonical.contains(r#""data":{"a":1,"b":2,"goal":"test"}"#));
    }
}
