#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-types** – Shared primitive data structures for the Aegis kernel.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, cryptography, or storage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod event_data;
pub mod reason;
pub mod scope;
pub mod status;

pub use event_data::EventData;
pub use reason::{DecisionKind, ReasonCode};
pub use scope::{ApprovalScope, ScopeTarget};
pub use status::{ApprovalStatus, RunStatus};

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum allowed length for a run goal description.
pub const MAX_GOAL_LEN: usize = 4096;

/// Maximum allowed length for an actor identifier.
pub const MAX_ACTOR_ID_LEN: usize = 256;

/// Maximum allowed length for an idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Maximum allowed size for a serialized event `data` payload.
pub const MAX_EVENT_DATA_LEN: usize = 1_048_576; // 1MB

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Unique identifier for a workspace.
pub type WorkspaceId = Uuid;

/// Unique identifier for a room.
pub type RoomId = Uuid;

/// Unique identifier for a thread.
pub type ThreadId = Uuid;

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Unique identifier for a step within a run.
pub type StepId = Uuid;

/// Unique identifier for an approval.
pub type ApprovalId = Uuid;

/// Stable identifier of a principal (human, agent, or service).
pub type PrincipalId = Uuid;

//─────────────────────────────
//  Actors
//─────────────────────────────

/// The kind of entity performing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// A human operator.
    User,
    /// An autonomous agent.
    Agent,
    /// A system or background service.
    Service,
}

impl ActorKind {
    /// Stable wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Service => "service",
        }
    }
}

/// Reference to the entity that caused an event.
///
/// The `id` is a stable, caller-supplied identifier (a login, an agent slug,
/// a service name). A durable [`PrincipalId`] is resolved from it at append
/// time and carried alongside on the persisted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    /// What kind of entity this is.
    pub kind: ActorKind,
    /// Stable caller-supplied identifier.
    pub id: String,
}

impl ActorRef {
    /// Construct an actor reference, validating the identifier length.
    pub fn new(kind: ActorKind, id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("actor id cannot be empty".to_string());
        }
        if id.len() > MAX_ACTOR_ID_LEN {
            return Err(format!(
                "actor id too long: {} > {}",
                id.len(),
                MAX_ACTOR_ID_LEN
            ));
        }
        Ok(Self { kind, id })
    }

    /// Convenience constructor for a user actor.
    pub fn user(id: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::User, id)
    }

    /// Convenience constructor for an agent actor.
    pub fn agent(id: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::Agent, id)
    }

    /// Convenience constructor for a service actor.
    pub fn service(id: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::Service, id)
    }
}

//─────────────────────────────
//  Security zones
//─────────────────────────────

/// Security posture label controlling which actions are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    /// Fully isolated; no outward side effects.
    Sandbox,
    /// The default posture for interactive work.
    #[default]
    Supervised,
    /// Elevated posture in which irreversible actions may proceed.
    HighStakes,
}

impl Zone {
    /// Stable wire name for this zone.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Supervised => "supervised",
            Self::HighStakes => "high_stakes",
        }
    }
}

//─────────────────────────────
//  Streams
//─────────────────────────────

/// The type of an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Workspace-scoped stream.
    Workspace,
    /// Room-scoped stream.
    Room,
    /// Thread-scoped stream.
    Thread,
}

impl StreamType {
    /// Stable wire name for this stream type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Room => "room",
            Self::Thread => "thread",
        }
    }

    /// Parse a wire name back into a stream type.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workspace" => Some(Self::Workspace),
            "room" => Some(Self::Room),
            "thread" => Some(Self::Thread),
            _ => None,
        }
    }
}

/// Reference to an ordered event stream: `(stream_type, stream_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    /// The stream's type.
    pub stream_type: StreamType,
    /// The stream's identifier (workspace, room, or thread id).
    pub stream_id: Uuid,
}

impl StreamRef {
    /// A workspace-scoped stream.
    pub fn workspace(id: WorkspaceId) -> Self {
        Self { stream_type: StreamType::Workspace, stream_id: id }
    }

    /// A room-scoped stream.
    pub fn room(id: RoomId) -> Self {
        Self { stream_type: StreamType::Room, stream_id: id }
    }

    /// A thread-scoped stream.
    pub fn thread(id: ThreadId) -> Self {
        Self { stream_type: StreamType::Thread, stream_id: id }
    }
}

//─────────────────────────────
//  Redaction
//─────────────────────────────

/// How much of an event's payload has been redacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionLevel {
    /// Payload is stored verbatim.
    #[default]
    None,
    /// Sensitive spans were masked in place.
    Masked,
    /// The payload body was removed entirely.
    Removed,
}

impl RedactionLevel {
    /// Stable wire name for this redaction level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Masked => "masked",
            Self::Removed => "removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_ref_rejects_empty_and_oversized_ids() {
        assert!(ActorRef::user("").is_err());
        assert!(ActorRef::user("   ").is_err());
        assert!(ActorRef::user("a".repeat(MAX_ACTOR_ID_LEN + 1)).is_err());
        assert!(ActorRef::user("alice").is_ok());
    }

    #[test]
    fn zone_defaults_to_supervised() {
        assert_eq!(Zone::default(), Zone::Supervised);
    }

    #[test]
    fn enum_wire_names_are_snake_case() {
        assert_eq!(serde_json::to_string(&Zone::HighStakes).unwrap(), "\"high_stakes\"");
        assert_eq!(serde_json::to_string(&StreamType::Workspace).unwrap(), "\"workspace\"");
        assert_eq!(serde_json::to_string(&ActorKind::Service).unwrap(), "\"service\"");
        assert_eq!(StreamType::parse("room"), Some(StreamType::Room));
        assert_eq!(StreamType::parse("other"), None);
    }
}
