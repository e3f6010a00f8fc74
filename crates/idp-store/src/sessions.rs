use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use idp_common::{IdentifierGenerator, NewSession, Principal, SessionError, SessionStore};
use indexmap::IndexMap;
use tracing::{debug, info};

/// Principals keyed by session id.
///
/// Session index updates happen under the map's entry lock, so concurrent
/// transactions for one principal never lose each other's indices.
pub struct InMemorySessionStore {
    principals: DashMap<String, Principal>,
    /// Federated identifier to session id
    federated: DashMap<String, String>,
    identifiers: Arc<dyn IdentifierGenerator>,
}

impl InMemorySessionStore {
    pub fn new(identifiers: Arc<dyn IdentifierGenerator>) -> Self {
        Self {
            principals: DashMap::new(),
            federated: DashMap::new(),
            identifiers,
        }
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }

    /// Insert a fully formed principal, replacing any session with the same id
    pub fn insert(&self, principal: Principal) {
        self.federated.insert(
            principal.federated_identifier.clone(),
            principal.session_id.clone(),
        );
        self.principals.insert(principal.session_id.clone(), principal);
    }

    /// Remove sessions whose expiry has passed; returns how many were removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .principals
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &expired {
            self.remove(session_id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Purged expired sessions");
        }
        expired.len()
    }

    fn remove(&self, session_id: &str) -> Option<Principal> {
        let (_, principal) = self.principals.remove(session_id)?;
        self.federated
            .remove_if(&principal.federated_identifier, |_, sid| sid == session_id);
        Some(principal)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn query(&self, session_id: &str) -> Result<Principal, SessionError> {
        self.principals
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn query_by_federated_identifier(&self, federated_identifier: &str) -> Result<Principal, SessionError> {
        let session_id = self
            .federated
            .get(federated_identifier)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(federated_identifier.to_string()))?;
        self.query(&session_id).await
    }

    async fn create(&self, session: NewSession) -> Result<Principal, SessionError> {
        if session.local_principal_identifier.is_empty() {
            return Err(SessionError::Store("principal identifier is required".to_string()));
        }
        let now = Utc::now();
        let principal = Principal {
            session_id: self.identifiers.generate_session_id(),
            federated_identifier: self.identifiers.generate_federated_identifier(),
            local_principal_identifier: session.local_principal_identifier,
            authn_timestamp: now,
            session_expiry: now + session.lifetime,
            authentication_context_class: session.authentication_context_class,
            attributes: session.attributes,
            service_session_indices: IndexMap::new(),
        };
        debug!(
            principal = %principal.local_principal_identifier,
            expires = %principal.session_expiry,
            "Created session"
        );
        self.insert(principal.clone());
        Ok(principal)
    }

    async fn record_service_session_index(
        &self,
        principal: &Principal,
        service_id: &str,
        index: &str,
    ) -> Result<(), SessionError> {
        let mut stored = self
            .principals
            .get_mut(&principal.session_id)
            .ok_or_else(|| SessionError::NotFound(principal.session_id.clone()))?;
        stored.add_service_session_index(service_id, index);
        Ok(())
    }

    async fn terminate(&self, session_id: &str) -> Result<(), SessionError> {
        if self.remove(session_id).is_some() {
            info!(session_id, "Session terminated");
        }
        Ok(())
    }
}
