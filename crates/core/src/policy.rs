//! Per-event admission policy.
//!
//! The policy engine is an external collaborator consumed through a narrow
//! query interface. Policy can only tighten an otherwise-ALLOW decision
//! (to REVIEW or DENY); it never rescues a denial.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InfraError;

/// Per-event rule set consumed by the decision pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    /// When true, the short-window duplicate-scan guard does not deny;
    /// the at-most-once ticket consumption check still applies.
    pub reentry_allowed: bool,
    /// Hard cap on admissions for the event, counted from the scan log.
    pub max_admissions: Option<u64>,
    /// When true, every otherwise-ALLOW is downgraded to REVIEW for manual
    /// confirmation at the gate.
    pub require_review: bool,
}

impl Default for PolicySet {
    fn default() -> Self {
        PolicySet {
            reentry_allowed: false,
            max_admissions: None,
            require_review: false,
        }
    }
}

/// Narrow query interface to the policy collaborator.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Rules for an event. Events without explicit rules get the default set.
    async fn get_rules(&self, event_id: &str) -> Result<PolicySet, InfraError>;
}

/// Fixed rule table, used by tests, the CLI, and offline devices (which
/// snapshot rules at manifest-load time).
#[derive(Default)]
pub struct StaticPolicyEngine {
    rules: BTreeMap<String, PolicySet>,
}

impl StaticPolicyEngine {
    pub fn new() -> Self {
        StaticPolicyEngine::default()
    }

    pub fn with_rules(mut self, event_id: &str, rules: PolicySet) -> Self {
        self.rules.insert(event_id.to_string(), rules);
        self
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn get_rules(&self, event_id: &str) -> Result<PolicySet, InfraError> {
        Ok(self.rules.get(event_id).cloned().unwrap_or_default())
    }
}
