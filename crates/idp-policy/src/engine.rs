//! Authorization decision engine
//!
//! Evaluates every rule of every cached policy for a service and combines
//! the applicable ones with deny-overrides:
//! 1. any applicable Deny rule gives Deny
//! 2. otherwise any applicable Permit rule gives Permit
//! 3. otherwise the configured default
//!
//! No short-circuiting: every applicable rule is reported. A rule whose
//! condition is malformed or references a missing attribute does not apply.

use std::sync::Arc;

use idp_common::{AttributeRecord, Decision};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::cache::PolicyCache;
use crate::policy::{RuleCondition, RuleSlot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedTarget {
    pub policy_id: String,
    pub rule_id: String,
    pub effect: Decision,
    /// Target pattern that matched, `None` for an untargeted rule
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub decision: Decision,
    pub applied_targets: Vec<AppliedTarget>,
    pub processed_policies: Vec<String>,
    pub group_targets: Vec<String>,
    pub default_applied: bool,
}

impl DecisionRecord {
    fn default_decision(decision: Decision) -> Self {
        Self {
            decision,
            applied_targets: Vec::new(),
            processed_policies: Vec::new(),
            group_targets: Vec::new(),
            default_applied: true,
        }
    }

    /// Distinct matched target patterns, in evaluation order
    pub fn matched_targets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for target in self.applied_targets.iter().filter_map(|a| a.target.as_ref()) {
            if !out.contains(target) {
                out.push(target.clone());
            }
        }
        out
    }
}

pub struct DecisionEngine {
    cache: Arc<PolicyCache>,
    default_decision: Decision,
}

impl DecisionEngine {
    pub fn new(cache: Arc<PolicyCache>, default_decision: Decision) -> Self {
        Self {
            cache,
            default_decision,
        }
    }

    pub fn default_decision(&self) -> Decision {
        self.default_decision
    }

    pub fn decide(
        &self,
        service_id: &str,
        subject: &IndexMap<String, AttributeRecord>,
        resource: &str,
    ) -> DecisionRecord {
        let policies = match self.cache.policies_for(service_id) {
            Some(set) if !set.is_empty() => set,
            _ => {
                debug!(service_id, resource, decision = %self.default_decision, "No policies cached, default decision");
                return DecisionRecord::default_decision(self.default_decision);
            }
        };

        let mut applied = Vec::new();
        let mut processed = Vec::with_capacity(policies.len());
        let mut group_targets = Vec::new();

        for cached in policies.iter() {
            let policy = &cached.policy;
            processed.push(policy.policy_id.clone());
            group_targets.extend(policy.target_strings().map(str::to_string));

            if !policy.covers(resource) {
                continue;
            }

            for slot in &policy.rules {
                let rule = match slot {
                    RuleSlot::Rule(rule) => rule,
                    RuleSlot::Malformed { rule_id, reason } => {
                        debug!(policy_id = %policy.policy_id, rule_id = ?rule_id, reason = %reason, "Skipping malformed rule");
                        continue;
                    }
                };

                let Some(target) = rule.matched_target(&policy.targets, resource) else {
                    continue;
                };

                let holds = match &rule.condition {
                    RuleCondition::Always => true,
                    RuleCondition::Expr(condition) => match condition.evaluate(subject) {
                        Some(holds) => holds,
                        None => {
                            debug!(policy_id = %policy.policy_id, rule_id = %rule.rule_id, "Condition references a missing attribute, rule does not apply");
                            false
                        }
                    },
                    RuleCondition::Malformed(reason) => {
                        debug!(policy_id = %policy.policy_id, rule_id = %rule.rule_id, reason = %reason, "Malformed condition, rule does not apply");
                        false
                    }
                };

                if holds {
                    applied.push(AppliedTarget {
                        policy_id: policy.policy_id.clone(),
                        rule_id: rule.rule_id.clone(),
                        effect: rule.effect,
                        target: target.map(str::to_string),
                    });
                }
            }
        }

        let (decision, default_applied) = if applied.iter().any(|a| a.effect == Decision::Deny) {
            (Decision::Deny, false)
        } else if applied.iter().any(|a| a.effect == Decision::Permit) {
            (Decision::Permit, false)
        } else {
            (self.default_decision, true)
        };

        debug!(
            service_id,
            resource,
            decision = %decision,
            applied = applied.len(),
            "Authorization decision"
        );

        DecisionRecord {
            decision,
            applied_targets: applied,
            processed_policies: processed,
            group_targets,
            default_applied,
        }
    }
}
