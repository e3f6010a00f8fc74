//! Sequenced in-memory policy store
//!
//! Every write gets the next sequence id and is appended to a change log,
//! which is what the synchronizer reads incrementally.

use async_trait::async_trait;
use idp_common::{PolicyAction, PolicyCacheEntry, PolicyChange, PolicyDurableStore, StoreError};
use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PolicyStoreError {
    #[error("Policy document is not valid JSON: {0}")]
    Document(#[from] serde_json::Error),

    #[error("Policy document has no policyId")]
    MissingPolicyId,
}

#[derive(Default)]
struct State {
    /// Active policies keyed by (service id, policy id)
    active: IndexMap<(String, String), PolicyCacheEntry>,
    changes: Vec<PolicyChange>,
    last_sequence_id: i64,
}

impl State {
    fn next_sequence_id(&mut self) -> i64 {
        self.last_sequence_id += 1;
        self.last_sequence_id
    }
}

#[derive(Default)]
pub struct InMemoryPolicyStore {
    state: RwLock<State>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a policy; returns its sequence id
    pub fn put(&self, service_id: &str, policy_id: &str, document: impl Into<String>) -> i64 {
        let mut state = self.state.write();
        let sequence_id = state.next_sequence_id();
        let entry = PolicyCacheEntry {
            service_id: service_id.to_string(),
            policy_id: policy_id.to_string(),
            policy_document: document.into(),
            sequence_id,
        };
        let key = (service_id.to_string(), policy_id.to_string());
        let action = if state.active.contains_key(&key) {
            PolicyAction::Update
        } else {
            PolicyAction::Add
        };
        debug!(service_id, policy_id, sequence_id, action = ?action, "Stored policy");

        state.active.insert(key, entry.clone());
        state.changes.push(PolicyChange { entry, action });
        sequence_id
    }

    /// Store a JSON policy document under the `policyId` it declares
    pub fn put_document(&self, service_id: &str, document: &str) -> Result<i64, PolicyStoreError> {
        let value: serde_json::Value = serde_json::from_str(document)?;
        let policy_id = value
            .get("policyId")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or(PolicyStoreError::MissingPolicyId)?;
        Ok(self.put(service_id, policy_id, document))
    }

    /// Remove a policy; `None` if it was not stored
    pub fn delete(&self, service_id: &str, policy_id: &str) -> Option<i64> {
        let mut state = self.state.write();
        let removed = state
            .active
            .shift_remove(&(service_id.to_string(), policy_id.to_string()))?;
        let sequence_id = state.next_sequence_id();
        state.changes.push(PolicyChange {
            entry: PolicyCacheEntry {
                sequence_id,
                ..removed
            },
            action: PolicyAction::Delete,
        });
        Some(sequence_id)
    }
}

#[async_trait]
impl PolicyDurableStore for InMemoryPolicyStore {
    async fn max_sequence_id(&self) -> Result<i64, StoreError> {
        Ok(self.state.read().last_sequence_id)
    }

    async fn fetch_changes_since(&self, sequence_id: i64) -> Result<Vec<PolicyChange>, StoreError> {
        Ok(self
            .state
            .read()
            .changes
            .iter()
            .filter(|change| change.entry.sequence_id > sequence_id)
            .cloned()
            .collect())
    }

    async fn fetch_all(&self) -> Result<Vec<PolicyCacheEntry>, StoreError> {
        Ok(self.state.read().active.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_are_sequenced() {
        let store = InMemoryPolicyStore::new();
        assert_eq!(store.max_sequence_id().await.unwrap(), 0);

        assert_eq!(store.put("spep:1", "p1", "{}"), 1);
        assert_eq!(store.put("spep:1", "p2", "{}"), 2);
        assert_eq!(store.put("spep:1", "p1", "{\"v\":2}"), 3);
        assert_eq!(store.delete("spep:1", "p2"), Some(4));
        assert_eq!(store.delete("spep:1", "p2"), None);

        assert_eq!(store.max_sequence_id().await.unwrap(), 4);

        let actions: Vec<PolicyAction> = store
            .fetch_changes_since(1)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.action)
            .collect();
        assert_eq!(actions, vec![PolicyAction::Add, PolicyAction::Update, PolicyAction::Delete]);

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].policy_document, "{\"v\":2}");
        assert_eq!(all[0].sequence_id, 3);
    }

    #[test]
    fn test_put_document_reads_policy_id() {
        let store = InMemoryPolicyStore::new();
        assert_eq!(store.put_document("spep:1", r#"{"policyId":"p","rules":[]}"#).unwrap(), 1);
        assert!(matches!(
            store.put_document("spep:1", r#"{"rules":[]}"#),
            Err(PolicyStoreError::MissingPolicyId)
        ));
        assert!(matches!(store.put_document("spep:1", "{"), Err(PolicyStoreError::Document(_))));
        assert_eq!(tokio_test::block_on(store.max_sequence_id()).unwrap(), 1);
    }
}
