//! In-memory policy cache
//!
//! Service id maps to an immutable, shared list of policies. Writers build a
//! new list and swap it in under the entry lock, so readers holding the old
//! `Arc` never observe a half-applied change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use idp_common::PolicyCacheEntry;
use tracing::debug;

use crate::error::{PolicyError, Result};
use crate::policy::Policy;

/// A cache record with its compiled policy
#[derive(Debug)]
pub struct CachedPolicy {
    pub entry: PolicyCacheEntry,
    pub policy: Policy,
}

impl CachedPolicy {
    pub fn from_entry(entry: PolicyCacheEntry) -> Result<Self> {
        let policy = Policy::parse(&entry.policy_document)?;
        Ok(Self { entry, policy })
    }

    pub fn policy_id(&self) -> &str {
        &self.entry.policy_id
    }
}

pub type PolicySet = Arc<Vec<Arc<CachedPolicy>>>;

#[derive(Debug, Default)]
pub struct PolicyCache {
    services: DashMap<String, PolicySet>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policies_for(&self, service_id: &str) -> Option<PolicySet> {
        self.services.get(service_id).map(|set| Arc::clone(set.value()))
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn policy_count(&self) -> usize {
        self.services.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.policy_count() == 0
    }

    /// Policy-level targets of every policy cached for the service
    pub fn group_targets(&self, service_id: &str) -> Vec<String> {
        self.policies_for(service_id)
            .map(|set| {
                set.iter()
                    .flat_map(|p| p.policy.target_strings().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the whole cache; returns every service id whose state changed
    pub fn replace_all(&self, policies: Vec<CachedPolicy>) -> HashSet<String> {
        let mut grouped: HashMap<String, Vec<Arc<CachedPolicy>>> = HashMap::new();
        for policy in policies {
            grouped
                .entry(policy.entry.service_id.clone())
                .or_default()
                .push(Arc::new(policy));
        }

        let mut touched: HashSet<String> = self.service_ids().into_iter().collect();
        touched.extend(grouped.keys().cloned());

        let incoming: HashSet<String> = grouped.keys().cloned().collect();
        for (service_id, set) in grouped {
            self.services.insert(service_id, Arc::new(set));
        }
        self.services.retain(|service_id, _| incoming.contains(service_id));

        touched
    }

    /// Add a policy; a policy id already cached for the service is an anomaly
    pub fn add(&self, policy: CachedPolicy) -> Result<()> {
        let service_id = policy.entry.service_id.clone();
        let mut slot = self.services.entry(service_id.clone()).or_default();

        if slot.iter().any(|p| p.policy_id() == policy.policy_id()) {
            return Err(PolicyError::Duplicate {
                service_id,
                policy_id: policy.entry.policy_id,
            });
        }

        let mut next: Vec<Arc<CachedPolicy>> = slot.iter().cloned().collect();
        next.push(Arc::new(policy));
        *slot = Arc::new(next);
        Ok(())
    }

    /// Replace the matching policy in place, or append it
    pub fn upsert(&self, policy: CachedPolicy) {
        let service_id = policy.entry.service_id.clone();
        let mut slot = self.services.entry(service_id).or_default();

        let mut next: Vec<Arc<CachedPolicy>> = slot.iter().cloned().collect();
        let policy = Arc::new(policy);
        match next.iter().position(|p| p.policy_id() == policy.policy_id()) {
            Some(pos) => next[pos] = policy,
            None => next.push(policy),
        }
        *slot = Arc::new(next);
    }

    /// Remove a policy; the service may be left with an empty set
    pub fn remove(&self, service_id: &str, policy_id: &str) -> bool {
        let Some(mut slot) = self.services.get_mut(service_id) else {
            debug!(service_id, policy_id, "Delete for uncached service");
            return false;
        };

        if !slot.iter().any(|p| p.policy_id() == policy_id) {
            return false;
        }
        let next: Vec<Arc<CachedPolicy>> = slot
            .iter()
            .filter(|p| p.policy_id() != policy_id)
            .cloned()
            .collect();
        *slot = Arc::new(next);
        true
    }
}
