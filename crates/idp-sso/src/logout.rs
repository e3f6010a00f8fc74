//! Best-effort logout fan-out
//!
//! Every active service of the principal is sent a signed logout request on
//! each of its logout endpoints. Failed sends go to the logout
//! [`RetryingDelivery`]; the local session is terminated regardless.

use std::sync::Arc;

use chrono::Utc;
use idp_common::protocol::{LogoutRequest, MessageHeader};
use idp_common::{
    IdentifierGenerator, MetadataResolver, Principal, ProtocolMessage, SessionError, SessionStore,
    SignedMessageCodec, SigningIdentity,
};
use idp_delivery::RetryingDelivery;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::LogoutError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutState {
    pub endpoint: String,
    pub succeeded: bool,
    pub description: String,
}

impl LogoutState {
    fn succeeded(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            succeeded: true,
            description: "Logout accepted by service".to_string(),
        }
    }

    fn failed(endpoint: &str, description: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            succeeded: false,
            description: description.into(),
        }
    }
}

/// Outcomes per service id, in the order the services were notified
pub type LogoutStates = IndexMap<String, Vec<LogoutState>>;

pub struct LogoutService {
    sessions: Arc<dyn SessionStore>,
    metadata: Arc<dyn MetadataResolver>,
    codec: Arc<dyn SignedMessageCodec>,
    identity: SigningIdentity,
    issuer: String,
    identifiers: Arc<dyn IdentifierGenerator>,
    retry: Arc<RetryingDelivery>,
    reason: String,
}

impl LogoutService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        metadata: Arc<dyn MetadataResolver>,
        codec: Arc<dyn SignedMessageCodec>,
        identity: SigningIdentity,
        issuer: impl Into<String>,
        identifiers: Arc<dyn IdentifierGenerator>,
        retry: Arc<RetryingDelivery>,
    ) -> Self {
        Self {
            sessions,
            metadata,
            codec,
            identity,
            issuer: issuer.into(),
            identifiers,
            retry,
            reason: "User initiated logout".to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub async fn logout(&self, session_id: &str) -> Result<LogoutStates, LogoutError> {
        let principal = match self.sessions.query(session_id).await {
            Ok(principal) => principal,
            Err(SessionError::NotFound(_)) => {
                return Err(LogoutError::InvalidSession(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut states = LogoutStates::new();
        for service_id in principal.active_service_ids() {
            let service_states = self.notify_service(&principal, service_id).await;
            states.insert(service_id.to_string(), service_states);
        }

        if let Err(e) = self.sessions.terminate(session_id).await {
            error!(error = %e, principal = %principal.local_principal_identifier, "Failed to terminate local session");
        }

        let failed = states
            .values()
            .flatten()
            .filter(|state| !state.succeeded)
            .count();
        info!(
            principal = %principal.local_principal_identifier,
            services = states.len(),
            failed,
            "Logout complete"
        );
        Ok(states)
    }

    async fn notify_service(&self, principal: &Principal, service_id: &str) -> Vec<LogoutState> {
        let endpoints = match self.metadata.resolve_logout_endpoints(service_id) {
            Ok(endpoints) if !endpoints.is_empty() => endpoints,
            Ok(_) => {
                warn!(service_id, "Service has no logout endpoints");
                return vec![LogoutState::failed("", "No logout endpoints registered for service")];
            }
            Err(e) => {
                warn!(service_id, error = %e, "Unable to resolve logout endpoints");
                return vec![LogoutState::failed("", e.to_string())];
            }
        };
        let session_indices = principal.session_indices_for(service_id).to_vec();

        let mut states = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let message = ProtocolMessage::LogoutRequest(LogoutRequest {
                header: MessageHeader::new(
                    self.identifiers.generate_message_id(),
                    self.issuer.clone(),
                    Utc::now(),
                ),
                name_id: principal.federated_identifier.clone(),
                reason: self.reason.clone(),
                session_indices: session_indices.clone(),
            });
            let payload = match self.codec.serialize(&message, &self.identity) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(service_id, endpoint = %endpoint, error = %e, "Unable to sign logout request");
                    states.push(LogoutState::failed(endpoint, e.to_string()));
                    continue;
                }
            };

            match self.retry.sender().send(endpoint, &payload).await {
                Ok(()) => states.push(LogoutState::succeeded(endpoint)),
                Err(e) => {
                    warn!(service_id, endpoint = %endpoint, error = %e, "Logout delivery failed, queued for retry");
                    self.retry.record(endpoint.clone(), payload);
                    states.push(LogoutState::failed(endpoint, e.to_string()));
                }
            }
        }
        states
    }
}
