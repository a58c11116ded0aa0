//! Approval and run status machines.
//!
//! Both state machines are deliberately closed: every legal transition is
//! enumerated here and everything else is rejected by the projectors and the
//! kernel as `invalid_state`.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Approvals
//─────────────────────────────

/// Lifecycle status of an approval request.
///
/// `pending → {approved, denied, held}`; `held → {approved, denied}`;
/// `approved` and `denied` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Parked for later review; still undecided.
    Held,
    /// Granted.
    Approved,
    /// Refused.
    Denied,
}

impl ApprovalStatus {
    /// Returns `true` if this status accepts no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Denied)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [ApprovalStatus] {
        match self {
            Self::Pending => &[Self::Approved, Self::Denied, Self::Held],
            Self::Held => &[Self::Approved, Self::Denied],
            Self::Approved | Self::Denied => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable wire name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Held => "held",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    /// Parse a wire name back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "held" => Some(Self::Held),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Runs
//─────────────────────────────

/// Lifecycle status of a run.
///
/// `queued → running → {succeeded, failed, cancelled, timed_out}`; terminal
/// states are absorbing. `queued → cancelled` is permitted so queued work can
/// be withdrawn without a worker ever touching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed and started.
    Running,
    /// Finished with evidence of success.
    Succeeded,
    /// Finished with evidence of failure.
    Failed,
    /// Withdrawn before or during execution.
    Cancelled,
    /// Terminated by the deadline sweeper.
    TimedOut,
}

impl RunStatus {
    /// Returns `true` if this status represents a terminal, absorbing state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [RunStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Succeeded, Self::Failed, Self::Cancelled, Self::TimedOut],
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable wire name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Parse a wire name back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_transition_matrix() {
        use ApprovalStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Denied));
        assert!(Pending.can_transition_to(Held));
        assert!(Held.can_transition_to(Approved));
        assert!(Held.can_transition_to(Denied));
        assert!(!Held.can_transition_to(Pending));
        assert!(!Approved.can_transition_to(Denied));
        assert!(!Denied.can_transition_to(Approved));
        assert!(Approved.is_terminal());
        assert!(!Held.is_terminal());
    }

    #[test]
    fn run_transition_matrix() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(TimedOut));
        for terminal in [Succeeded, Failed, Cancelled, TimedOut] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn status_round_trips_through_wire_names() {
        for s in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            ApprovalStatus::Pending,
            ApprovalStatus::Held,
            ApprovalStatus::Approved,
            ApprovalStatus::Denied,
        ] {
            assert_eq!(ApprovalStatus::parse(s.as_str()), Some(s));
        }
    }
}
