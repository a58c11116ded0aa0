//! Approval scopes and scope matching.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RoomId, RunId};

/// The domain over which an approval allows subsequent requests.
///
/// `Once` and `Template` are persisted but never matched here: they must be
/// promoted by a higher-level scheduler before they can allow anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalScope {
    /// Allows every matching request within the approval's workspace.
    Workspace,
    /// Allows matching requests originating from one room.
    Room {
        /// The room the approval is bound to.
        room_id: RoomId,
    },
    /// Allows matching requests for one specific run.
    Run {
        /// The run the approval is bound to.
        run_id: RunId,
    },
    /// Single-use grant; non-matching at this layer.
    Once,
    /// Reusable template grant; non-matching at this layer.
    Template,
}

/// The request-side coordinates a scope is matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeTarget {
    /// Room the request originates from, if any.
    pub room_id: Option<Uuid>,
    /// Run the request belongs to, if any.
    pub run_id: Option<Uuid>,
}

impl ApprovalScope {
    /// Returns `true` if this scope allows a request at `target`.
    ///
    /// Workspace scope always matches (the approval lookup is already
    /// workspace-bound). `Once` and `Template` never match.
    pub fn matches(&self, target: &ScopeTarget) -> bool {
        match self {
            Self::Workspace => true,
            Self::Room { room_id } => target.room_id == Some(*room_id),
            Self::Run { run_id } => target.run_id == Some(*run_id),
            Self::Once | Self::Template => false,
        }
    }

    /// Stable wire name of the scope kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Room { .. } => "room",
            Self::Run { .. } => "run",
            Self::Once => "once",
            Self::Template => "template",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_scope_matches_everything() {
        let scope = ApprovalScope::Workspace;
        assert!(scope.matches(&ScopeTarget::default()));
        assert!(scope.matches(&ScopeTarget {
            room_id: Some(Uuid::new_v4()),
            run_id: Some(Uuid::new_v4()),
        }));
    }

    #[test]
    fn room_scope_matches_only_its_room() {
        let room = Uuid::new_v4();
        let scope = ApprovalScope::Room { room_id: room };
        assert!(scope.matches(&ScopeTarget { room_id: Some(room), run_id: None }));
        assert!(!scope.matches(&ScopeTarget { room_id: Some(Uuid::new_v4()), run_id: None }));
        assert!(!scope.matches(&ScopeTarget::default()));
    }

    #[test]
    fn run_scope_matches_only_its_run() {
        let run = Uuid::new_v4();
        let scope = ApprovalScope::Run { run_id: run };
        assert!(scope.matches(&ScopeTarget { room_id: None, run_id: Some(run) }));
        assert!(!scope.matches(&ScopeTarget { room_id: None, run_id: Some(Uuid::new_v4()) }));
    }

    #[test]
    fn once_and_template_never_match() {
        let target = ScopeTarget {
            room_id: Some(Uuid::new_v4()),
            run_id: Some(Uuid::new_v4()),
        };
        assert!(!ApprovalScope::Once.matches(&target));
        assert!(!ApprovalScope::Template.matches(&target));
    }

    #[test]
    fn scope_serializes_with_type_tag() {
        let room = Uuid::new_v4();
        let json = serde_json::to_value(ApprovalScope::Room { room_id: room }).unwrap();
        assert_eq!(json["type"], "room");
        assert_eq!(json["room_id"], serde_json::json!(room));
        let json = serde_json::to_value(ApprovalScope::Workspace).unwrap();
        assert_eq!(json["type"], "workspace");
    }
}
