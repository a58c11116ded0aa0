#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-policy** – The decision gate of the Aegis kernel.
//!
//! Every outward-facing action is classified as `allow | deny |
//! require_approval` by five layers evaluated in order, first non-null
//! verdict wins:
//!
//! 1. capability token check (when a token id is supplied);
//! 2. action registry policy (zone and reversibility rules);
//! 3. quarantine check for egress by quarantined agent principals;
//! 4. hourly egress quota per principal;
//! 5. base policy (`external.write` kill switch + approval matching,
//!    data-access labels, default allow).
//!
//! The gate itself is a deterministic function of its inputs; everything it
//! needs from persistence comes through the [`PolicyStore`] trait. Side
//! effects of negative decisions (events, learning records) are the
//! kernel's responsibility.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_capability::CapabilityRecord;
use aegis_types::{ActorKind, ActorRef, ApprovalScope, DecisionKind, ReasonCode, ScopeTarget, Zone};

pub mod registry;

pub use registry::{ActionRegistry, ActionSpec};

//─────────────────────────────
//  Requests & context
//─────────────────────────────

/// A proposed action submitted to the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// The action type, e.g. `external.write` or `data.read`.
    pub action: String,
    /// Who is asking.
    pub actor: ActorRef,
    /// The asking actor's resolved principal, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<Uuid>,
    /// Workspace scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Uuid>,
    /// Room scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    /// Run scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Security posture the request runs under.
    #[serde(default)]
    pub zone: Zone,
    /// Capability token id (`jti`) presented with the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token_id: Option<String>,
    /// Structured request context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ActionContext>,
}

/// Structured context accompanying an [`ActionRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionContext {
    /// Data-access descriptor for `data.read` / `data.write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_access: Option<DataAccessContext>,
    /// Tool-call descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolContext>,
    /// Egress descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<EgressContext>,
}

/// Sensitivity classification of a data-access target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAccessLabel {
    /// Anyone may read.
    Public,
    /// Workspace-internal.
    Internal,
    /// Bound to one room.
    Restricted,
    /// Needs a purpose match or justification.
    Confidential,
    /// Personally identifiable; strictest handling.
    SensitivePii,
}

impl DataAccessLabel {
    /// Stable wire name for this label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Restricted => "restricted",
            Self::Confidential => "confidential",
            Self::SensitivePii => "sensitive_pii",
        }
    }
}

/// Data-access request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAccessContext {
    /// The target's sensitivity label.
    pub label: DataAccessLabel,
    /// The target identifier (dataset, collection, path).
    pub target: String,
    /// The room a `restricted` label is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_room_id: Option<Uuid>,
    /// Whether the declared purpose disagrees with the label's purpose hint.
    #[serde(default)]
    pub purpose_hint_mismatch: bool,
    /// Whether the requester supplied a justification.
    #[serde(default)]
    pub justification_provided: bool,
}

/// Tool-call request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    /// Name of the tool being invoked.
    pub name: String,
}

/// Egress request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressContext {
    /// The destination domain.
    pub domain: String,
}

//─────────────────────────────
//  Decisions
//─────────────────────────────

/// The gate's verdict on one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// `allow`, `deny`, or `require_approval`.
    pub decision: DecisionKind,
    /// Machine-readable reason.
    pub reason_code: ReasonCode,
    /// Human-readable reason.
    pub reason: String,
    /// Whether the caller must actually stop. `false` for allow, and for
    /// every decision in shadow mode.
    pub blocked: bool,
}

impl Decision {
    fn allow(reason_code: ReasonCode, reason: impl Into<String>) -> Self {
        Self { decision: DecisionKind::Allow, reason_code, reason: reason.into(), blocked: false }
    }

    fn deny(reason_code: ReasonCode, reason: impl Into<String>) -> Self {
        Self { decision: DecisionKind::Deny, reason_code, reason: reason.into(), blocked: true }
    }

    fn require_approval(reason_code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            decision: DecisionKind::RequireApproval,
            reason_code,
            reason: reason.into(),
            blocked: true,
        }
    }

    /// Whether the verdict is `allow`.
    pub fn is_allow(&self) -> bool {
        self.decision == DecisionKind::Allow
    }
}

/// Whether negative decisions block the action or are merely recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Record negative decisions without blocking.
    Shadow,
    /// Block on negative decisions.
    #[default]
    Enforce,
}

//─────────────────────────────
//  Store access
//─────────────────────────────

/// An approved, unexpired grant relevant to a request.
#[derive(Debug, Clone)]
pub struct ApprovalGrant {
    /// The grant's scope.
    pub scope: ApprovalScope,
    /// When the grant lapses, if bounded.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything the gate needs from persistence.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// Active (`approved`, unexpired at `now`) grants for
    /// `(workspace, action)`.
    async fn active_approvals(
        &self,
        workspace_id: Uuid,
        action: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ApprovalGrant>>;

    /// The registry row for a capability token id.
    async fn capability(&self, token_id: &str) -> anyhow::Result<Option<CapabilityRecord>>;

    /// Whether a principal is quarantined.
    async fn is_quarantined(&self, principal_id: Uuid) -> anyhow::Result<bool>;

    /// Egress events recorded for a principal in the hour before `now`.
    async fn egress_count_last_hour(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;
}

/// Errors surfaced by the gate.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Persistence failure while gathering decision inputs.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

//─────────────────────────────
//  The gate
//─────────────────────────────

/// Configuration for a [`PolicyGate`].
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Force-deny external writes when set.
    pub kill_switch: bool,
    /// Shadow or enforce.
    pub mode: EnforcementMode,
    /// Hourly egress quota per principal.
    pub egress_hourly_quota: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kill_switch: false,
            mode: EnforcementMode::Enforce,
            egress_hourly_quota: 100,
        }
    }
}

/// The layered decision gate.
pub struct PolicyGate<S> {
    store: S,
    registry: ActionRegistry,
    kill_switch: AtomicBool,
    shadow: AtomicBool,
    egress_hourly_quota: u64,
}

impl<S: PolicyStore> PolicyGate<S> {
    /// Build a gate over `store` with `config` and the default action
    /// registry.
    pub fn new(store: S, config: PolicyConfig) -> Self {
        Self::with_registry(store, config, ActionRegistry::builtin())
    }

    /// Build a gate with an explicit action registry.
    pub fn with_registry(store: S, config: PolicyConfig, registry: ActionRegistry) -> Self {
        Self {
            store,
            registry,
            kill_switch: AtomicBool::new(config.kill_switch),
            shadow: AtomicBool::new(config.mode == EnforcementMode::Shadow),
            egress_hourly_quota: config.egress_hourly_quota,
        }
    }

    /// The store the gate reads decision inputs from.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Flip the kill switch at runtime.
    pub fn set_kill_switch(&self, active: bool) {
        self.kill_switch.store(active, Ordering::SeqCst);
    }

    /// Whether the kill switch is currently active.
    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    /// Switch between shadow and enforce at runtime.
    pub fn set_mode(&self, mode: EnforcementMode) {
        self.shadow.store(mode == EnforcementMode::Shadow, Ordering::SeqCst);
    }

    /// The current enforcement mode.
    pub fn mode(&self) -> EnforcementMode {
        if self.shadow.load(Ordering::SeqCst) {
            EnforcementMode::Shadow
        } else {
            EnforcementMode::Enforce
        }
    }

    /// Evaluate a request through the five decision layers.
    pub async fn evaluate(&self, request: &ActionRequest) -> Result<Decision, PolicyError> {
        let now = Utc::now();
        let mut decision = self.evaluate_at(request, now).await?;
        if self.mode() == EnforcementMode::Shadow {
            decision.blocked = false;
        }
        Ok(decision)
    }

    /// Layered evaluation at an explicit `now`; exposed for deterministic
    /// tests.
    pub async fn evaluate_at(
        &self,
        request: &ActionRequest,
        now: DateTime<Utc>,
    ) -> Result<Decision, PolicyError> {
        if let Some(decision) = self.check_capability(request, now).await? {
            return Ok(decision);
        }
        if let Some(decision) = self.check_registry(request) {
            return Ok(decision);
        }
        if let Some(decision) = self.check_quarantine(request).await? {
            return Ok(decision);
        }
        if let Some(decision) = self.check_egress_quota(request, now).await? {
            return Ok(decision);
        }
        self.base_policy(request, now).await
    }

    //───────────────────── layer 1: capability ─────────────────────

    async fn check_capability(
        &self,
        request: &ActionRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, PolicyError> {
        let Some(token_id) = &request.capability_token_id else {
            return Ok(None);
        };
        let Some(record) = self.store.capability(token_id).await? else {
            return Ok(Some(Decision::deny(
                ReasonCode::CapabilityUnknown,
                "no capability token with this id exists",
            )));
        };
        if record.revoked {
            return Ok(Some(Decision::deny(
                ReasonCode::CapabilityRevoked,
                "the capability token has been revoked",
            )));
        }
        if record.is_expired(now) {
            return Ok(Some(Decision::deny(
                ReasonCode::CapabilityExpired,
                "the capability token has expired",
            )));
        }
        if let Some(principal_id) = request.principal_id {
            if record.principal_id != principal_id {
                return Ok(Some(Decision::deny(
                    ReasonCode::CapabilityPrincipalMismatch,
                    "the capability token belongs to a different principal",
                )));
            }
        }
        if let Some(room_id) = request.room_id {
            if !record.scopes.covers_room(&room_id.to_string()) {
                return Ok(Some(Decision::deny(
                    ReasonCode::CapabilityScopeRoom,
                    "the capability token does not cover this room",
                )));
            }
        }
        if !record.scopes.covers_action(&request.action) {
            return Ok(Some(Decision::deny(
                ReasonCode::CapabilityScopeAction,
                "the capability token does not cover this action",
            )));
        }
        if let Some(context) = &request.context {
            if let Some(tool) = &context.tool {
                if !record.scopes.covers_tool(&tool.name) {
                    return Ok(Some(Decision::deny(
                        ReasonCode::CapabilityScopeTool,
                        "the capability token does not cover this tool",
                    )));
                }
            }
            if let Some(data) = &context.data_access {
                if !record.scopes.covers_data_target(&data.target) {
                    return Ok(Some(Decision::deny(
                        ReasonCode::CapabilityScopeData,
                        "the capability token does not cover this data target",
                    )));
                }
            }
            if let Some(egress) = &context.egress {
                if !record.scopes.covers_egress(&egress.domain) {
                    return Ok(Some(Decision::deny(
                        ReasonCode::CapabilityScopeEgress,
                        "the capability token does not cover this egress domain",
                    )));
                }
            }
        }
        // Token checks out; later layers still apply.
        Ok(None)
    }

    //───────────────────── layer 2: action registry ─────────────────────

    fn check_registry(&self, request: &ActionRequest) -> Option<Decision> {
        let spec = self.registry.get(&request.action)?;
        if let Some(required_zone) = spec.required_zone {
            if request.zone != required_zone {
                return Some(Decision::deny(
                    ReasonCode::ZoneViolation,
                    format!("action requires the {} zone", required_zone.as_str()),
                ));
            }
        }
        if spec.requires_pre_approval {
            return Some(Decision::require_approval(
                ReasonCode::PreApprovalRequired,
                "this action is registered as requiring pre-approval",
            ));
        }
        if spec.irreversible && request.zone != Zone::HighStakes {
            return Some(Decision::require_approval(
                ReasonCode::IrreversibleOutsideHighStakes,
                "irreversible actions outside the high-stakes zone need approval",
            ));
        }
        None
    }

    //───────────────────── layer 3: quarantine ─────────────────────

    async fn check_quarantine(
        &self,
        request: &ActionRequest,
    ) -> Result<Option<Decision>, PolicyError> {
        let is_egress = request
            .context
            .as_ref()
            .map(|c| c.egress.is_some())
            .unwrap_or(false);
        if !is_egress || request.actor.kind != ActorKind::Agent {
            return Ok(None);
        }
        let Some(principal_id) = request.principal_id else {
            return Ok(None);
        };
        if self.store.is_quarantined(principal_id).await? {
            return Ok(Some(Decision::deny(
                ReasonCode::AgentQuarantined,
                "the requesting agent principal is quarantined",
            )));
        }
        Ok(None)
    }

    //───────────────────── layer 4: egress quota ─────────────────────

    async fn check_egress_quota(
        &self,
        request: &ActionRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, PolicyError> {
        let is_egress = request
            .context
            .as_ref()
            .map(|c| c.egress.is_some())
            .unwrap_or(false);
        if !is_egress {
            return Ok(None);
        }
        let Some(principal_id) = request.principal_id else {
            return Ok(None);
        };
        let used = self.store.egress_count_last_hour(principal_id, now).await?;
        if used >= self.egress_hourly_quota {
            return Ok(Some(Decision::deny(
                ReasonCode::QuotaExceeded,
                format!("hourly egress quota of {} exhausted", self.egress_hourly_quota),
            )));
        }
        Ok(None)
    }

    //───────────────────── layer 5: base policy ─────────────────────

    async fn base_policy(
        &self,
        request: &ActionRequest,
        now: DateTime<Utc>,
    ) -> Result<Decision, PolicyError> {
        if request.action == "external.write" {
            if self.kill_switch_active() {
                return Ok(Decision::deny(
                    ReasonCode::KillSwitchActive,
                    "the kill switch forces deny for external writes",
                ));
            }
            let target = ScopeTarget { room_id: request.room_id, run_id: request.run_id };
            if let Some(workspace_id) = request.workspace_id {
                let grants = self
                    .store
                    .active_approvals(workspace_id, &request.action, now)
                    .await?;
                if grants.iter().any(|grant| grant.scope.matches(&target)) {
                    return Ok(Decision::allow(
                        ReasonCode::ApprovalAllowsAction,
                        "a matching approval allows this action",
                    ));
                }
            }
            return Ok(Decision::require_approval(
                ReasonCode::ExternalWriteRequiresApproval,
                "external writes need an approval",
            ));
        }

        if request.action == "data.read" || request.action == "data.write" {
            if let Some(data) = request.context.as_ref().and_then(|c| c.data_access.as_ref()) {
                return Ok(self.data_access_policy(request, data));
            }
        }

        Ok(Decision::allow(ReasonCode::DefaultAllow, "no policy restricts this action"))
    }

    fn data_access_policy(
        &self,
        request: &ActionRequest,
        data: &DataAccessContext,
    ) -> Decision {
        match data.label {
            DataAccessLabel::Public | DataAccessLabel::Internal => {
                Decision::allow(ReasonCode::DefaultAllow, "label permits workspace access")
            }
            DataAccessLabel::Restricted => {
                if data.label_room_id.is_some() && request.room_id == data.label_room_id {
                    Decision::allow(ReasonCode::DefaultAllow, "request comes from the label's room")
                } else {
                    Decision::deny(
                        ReasonCode::DataAccessRestrictedRoomMismatch,
                        "restricted data may only be touched from its own room",
                    )
                }
            }
            DataAccessLabel::Confidential | DataAccessLabel::SensitivePii => {
                if data.purpose_hint_mismatch && !data.justification_provided {
                    Decision::require_approval(
                        ReasonCode::DataAccessPurposeHintMismatch,
                        "purpose hint mismatch without justification needs approval",
                    )
                } else {
                    Decision::allow(ReasonCode::DefaultAllow, "purpose and label agree")
                }
            }
        }
    }
}

//─────────────────────────────
//  In-memory store (tests)
//─────────────────────────────

/// A [`PolicyStore`] over plain maps; for tests and embedding.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    /// Grants per `(workspace, action)`.
    pub approvals: HashMap<(Uuid, String), Vec<ApprovalGrant>>,
    /// Capability records by `jti`.
    pub capabilities: HashMap<String, CapabilityRecord>,
    /// Quarantined principals.
    pub quarantined: Vec<Uuid>,
    /// Egress counts per principal.
    pub egress_counts: HashMap<Uuid, u64>,
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn active_approvals(
        &self,
        workspace_id: Uuid,
        action: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ApprovalGrant>> {
        Ok(self
            .approvals
            .get(&(workspace_id, action.to_string()))
            .map(|grants| {
                grants
                    .iter()
                    .filter(|g| g.expires_at.map(|exp| exp > now).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn capability(&self, token_id: &str) -> anyhow::Result<Option<CapabilityRecord>> {
        Ok(self.capabilities.get(token_id).cloned())
    }

    async fn is_quarantined(&self, principal_id: Uuid) -> anyhow::Result<bool> {
        Ok(self.quarantined.contains(&principal_id))
    }

    async fn egress_count_last_hour(
        &self,
        principal_id: Uuid,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        Ok(self.egress_counts.get(&principal_id).copied().unwrap_or(0))
    }
}
