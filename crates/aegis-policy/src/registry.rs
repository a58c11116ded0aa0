//! The action registry: per-action zone and reversibility policy.
//!
//! `external.write` is deliberately *not* registered here; its escalation
//! and approval matching live in the base-policy layer so that a granted
//! approval can actually allow it.

use std::collections::HashMap;

use aegis_types::Zone;

/// Policy attributes of one registered action.
#[derive(Debug, Clone, Default)]
pub struct ActionSpec {
    /// The action cannot be undone once executed.
    pub irreversible: bool,
    /// The action always needs an approval, reversible or not.
    pub requires_pre_approval: bool,
    /// The action may only run in this zone.
    pub required_zone: Option<Zone>,
}

/// Registered actions and their policy attributes.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionSpec>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in registrations.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("workspace.purge", ActionSpec { irreversible: true, ..Default::default() });
        registry.register("data.export", ActionSpec { irreversible: true, ..Default::default() });
        registry.register(
            "agent.promote",
            ActionSpec { requires_pre_approval: true, ..Default::default() },
        );
        registry.register(
            "secrets.rotate",
            ActionSpec { required_zone: Some(Zone::HighStakes), ..Default::default() },
        );
        registry
    }

    /// Register (or replace) an action's policy attributes.
    pub fn register(&mut self, action: impl Into<String>, spec: ActionSpec) {
        self.actions.insert(action.into(), spec);
    }

    /// Look up an action's policy attributes.
    pub fn get(&self, action: &str) -> Option<&ActionSpec> {
        self.actions.get(action)
    }
}
