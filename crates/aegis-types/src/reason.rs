//! The policy decision kinds and the closed reason-code catalog.
//!
//! Every caller-visible outcome carries a machine-readable [`ReasonCode`];
//! UIs render localized messages keyed by it and must never parse the
//! human-readable text.

use serde::{Deserialize, Serialize};

/// The three possible outcomes of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The action may proceed.
    Allow,
    /// The action is refused.
    Deny,
    /// The action needs an explicit approval before it can proceed.
    RequireApproval,
}

impl DecisionKind {
    /// Stable wire name for this decision.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        }
    }
}

/// Closed catalog of machine-readable reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReasonCode {
    // Policy outcomes
    /// Nothing restricted the action.
    DefaultAllow,
    /// A matching, unexpired approval allowed the action.
    ApprovalAllowsAction,
    /// `external.write` has no matching approval yet.
    ExternalWriteRequiresApproval,
    /// The kill-switch flag forces deny for external writes.
    KillSwitchActive,
    /// Restricted data was requested from outside its room.
    DataAccessRestrictedRoomMismatch,
    /// Purpose hint mismatched and no justification was provided.
    DataAccessPurposeHintMismatch,
    /// The requesting agent principal is quarantined.
    AgentQuarantined,
    /// The principal exhausted its hourly egress quota.
    QuotaExceeded,
    /// An irreversible action was attempted outside the high-stakes zone.
    IrreversibleOutsideHighStakes,
    /// The action is registered as requiring pre-approval.
    PreApprovalRequired,
    /// The action's registered zone requirement was not met.
    ZoneViolation,

    // Capability failures
    /// No capability token with the supplied id exists.
    CapabilityUnknown,
    /// The capability token has been revoked.
    CapabilityRevoked,
    /// The capability token has expired.
    CapabilityExpired,
    /// The token belongs to a different principal than claimed.
    CapabilityPrincipalMismatch,
    /// The token's scopes do not cover the requested room.
    CapabilityScopeRoom,
    /// The token's scopes do not cover the requested action type.
    CapabilityScopeAction,
    /// The token's scopes do not cover the requested tool.
    CapabilityScopeTool,
    /// The token's scopes do not cover the requested data target.
    CapabilityScopeData,
    /// The token's scopes do not cover the requested egress domain.
    CapabilityScopeEgress,

    // Store and lifecycle outcomes
    /// A duplicate append returned the pre-existing event; not an error.
    IdempotentReplay,
    /// The payload carried material the secret policy refuses to persist.
    SecretDetected,
    /// The sequence allocator could not return exactly one row.
    AllocationFailure,
    /// Chain verification found a broken linkage.
    HashChainBreak,
    /// Chain verification recomputed a different event hash.
    EventHashMismatch,
    /// A terminal run outcome was submitted without an evidence reference.
    EvidenceRequired,
    /// The caller's claim token no longer owns the run's lease.
    LeaseLost,
    /// The heartbeat arrived faster than the minimum interval; lease kept.
    Throttled,
    /// The requested state transition is not in the machine.
    InvalidState,
    /// Another decider already resolved the approval.
    AlreadyDecided,
    /// The referenced entity does not exist.
    NotFound,
    /// The request body failed contract validation.
    MalformedRequest,
    /// The request's schema version is outside the accepted window.
    UnsupportedSchemaVersion,
    /// The in-flight operation was abandoned at the caller's deadline.
    Cancelled,
    /// An unexpected backend failure; retry with bounded backoff.
    Internal,
}

impl ReasonCode {
    /// Stable wire name for this reason code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultAllow => "default_allow",
            Self::ApprovalAllowsAction => "approval_allows_action",
            Self::ExternalWriteRequiresApproval => "external_write_requires_approval",
            Self::KillSwitchActive => "kill_switch_active",
            Self::DataAccessRestrictedRoomMismatch => "data_access_restricted_room_mismatch",
            Self::DataAccessPurposeHintMismatch => "data_access_purpose_hint_mismatch",
            Self::AgentQuarantined => "agent_quarantined",
            Self::QuotaExceeded => "quota_exceeded",
            Self::IrreversibleOutsideHighStakes => "irreversible_outside_high_stakes",
            Self::PreApprovalRequired => "pre_approval_required",
            Self::ZoneViolation => "zone_violation",
            Self::CapabilityUnknown => "capability_unknown",
            Self::CapabilityRevoked => "capability_revoked",
            Self::CapabilityExpired => "capability_expired",
            Self::CapabilityPrincipalMismatch => "capability_principal_mismatch",
            Self::CapabilityScopeRoom => "capability_scope_room",
            Self::CapabilityScopeAction => "capability_scope_action",
            Self::CapabilityScopeTool => "capability_scope_tool",
            Self::CapabilityScopeData => "capability_scope_data",
            Self::CapabilityScopeEgress => "capability_scope_egress",
            Self::IdempotentReplay => "idempotent_replay",
            Self::SecretDetected => "secret_detected",
            Self::AllocationFailure => "allocation_failure",
            Self::HashChainBreak => "hash_chain_break",
            Self::EventHashMismatch => "event_hash_mismatch",
            Self::EvidenceRequired => "evidence_required",
            Self::LeaseLost => "lease_lost",
            Self::Throttled => "throttled",
            Self::InvalidState => "invalid_state",
            Self::AlreadyDecided => "already_decided",
            Self::NotFound => "not_found",
            Self::MalformedRequest => "malformed_request",
            Self::UnsupportedSchemaVersion => "unsupported_schema_version",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&ReasonCode::KillSwitchActive).unwrap(),
            "\"kill_switch_active\""
        );
        assert_eq!(
            serde_json::to_string(&ReasonCode::CapabilityScopeEgress).unwrap(),
            "\"capability_scope_egress\""
        );
        assert_eq!(ReasonCode::LeaseLost.to_string(), "lease_lost");
    }

    #[test]
    fn decision_kinds_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&DecisionKind::RequireApproval).unwrap(),
            "\"require_approval\""
        );
    }
}
