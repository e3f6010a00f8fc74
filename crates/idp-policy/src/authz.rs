//! Signed authorization query handling
//!
//! Verifies an inbound decision query, resolves the subject's session by
//! federated identifier and answers with a signed decision. Every protocol
//! failure is answered with a signed failure status rather than an error.

use std::sync::Arc;

use chrono::Utc;
use idp_common::protocol::{AuthzDecisionResponse, MessageHeader, Status, StatusCode, SubStatusCode};
use idp_common::{
    IdentifierGenerator, MetadataResolver, ProtocolMessage, SessionError, SessionStore,
    SignedMessageCodec, SigningIdentity, VerifyWith,
};
use tracing::{info, warn};

use crate::engine::DecisionEngine;
use crate::error::Result;

pub struct AuthorizationProcessor {
    engine: Arc<DecisionEngine>,
    sessions: Arc<dyn SessionStore>,
    metadata: Arc<dyn MetadataResolver>,
    codec: Arc<dyn SignedMessageCodec>,
    identity: SigningIdentity,
    issuer: String,
    identifiers: Arc<dyn IdentifierGenerator>,
}

impl AuthorizationProcessor {
    pub fn new(
        engine: Arc<DecisionEngine>,
        sessions: Arc<dyn SessionStore>,
        metadata: Arc<dyn MetadataResolver>,
        codec: Arc<dyn SignedMessageCodec>,
        identity: SigningIdentity,
        issuer: impl Into<String>,
        identifiers: Arc<dyn IdentifierGenerator>,
    ) -> Self {
        Self {
            engine,
            sessions,
            metadata,
            codec,
            identity,
            issuer: issuer.into(),
            identifiers,
        }
    }

    /// Answer a signed query; errors only if the answer itself cannot be signed
    pub async fn process_query(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let query = match self.codec.deserialize(bytes, &VerifyWith::Resolver) {
            Ok(ProtocolMessage::AuthzDecisionQuery(query)) => query,
            Ok(other) => {
                warn!(kind = other.kind(), "Expected an authorization query");
                return self.failure(
                    Some(other.header().id.clone()),
                    StatusCode::Requester,
                    SubStatusCode::RequestDenied,
                    "Message is not an authorization decision query",
                );
            }
            Err(e) => {
                warn!(error = %e, "Rejecting unverifiable authorization query");
                return self.failure(
                    None,
                    StatusCode::Requester,
                    SubStatusCode::RequestDenied,
                    "Query signature or format was invalid",
                );
            }
        };

        let service_id = query.header.issuer.clone();
        if !self.metadata.is_known_service(&service_id) {
            warn!(service_id = %service_id, "Authorization query from unknown service");
            return self.failure(
                Some(query.header.id),
                StatusCode::Requester,
                SubStatusCode::RequestDenied,
                "Issuer is not a known service",
            );
        }

        let principal = match self.sessions.query_by_federated_identifier(&query.subject).await {
            Ok(principal) if !principal.is_expired(Utc::now()) => principal,
            Ok(_) | Err(SessionError::NotFound(_)) => {
                info!(service_id = %service_id, "Authorization query for unknown or expired principal");
                return self.failure(
                    Some(query.header.id),
                    StatusCode::Responder,
                    SubStatusCode::UnknownPrincipal,
                    "Principal has no active session",
                );
            }
            Err(e) => {
                warn!(error = %e, "Session store failure during authorization query");
                return self.failure(
                    Some(query.header.id),
                    StatusCode::Responder,
                    SubStatusCode::RequestDenied,
                    "Session lookup failed",
                );
            }
        };

        let record = self.engine.decide(&service_id, &principal.attributes, &query.resource);
        info!(
            service_id = %service_id,
            resource = %query.resource,
            decision = %record.decision,
            "Authorization query answered"
        );

        let response = ProtocolMessage::AuthzDecisionResponse(AuthzDecisionResponse {
            header: self.header(),
            in_response_to: Some(query.header.id),
            status: Status::success(),
            decision: Some(record.decision),
            matched_targets: record.matched_targets(),
            resource: Some(query.resource),
        });
        Ok(self.codec.serialize(&response, &self.identity)?)
    }

    fn header(&self) -> MessageHeader {
        MessageHeader::new(self.identifiers.generate_message_id(), self.issuer.clone(), Utc::now())
    }

    fn failure(
        &self,
        in_response_to: Option<String>,
        code: StatusCode,
        sub_code: SubStatusCode,
        message: &str,
    ) -> Result<Vec<u8>> {
        let response = ProtocolMessage::AuthzDecisionResponse(AuthzDecisionResponse {
            header: self.header(),
            in_response_to,
            status: Status::failure(code, sub_code, message),
            decision: None,
            resource: None,
            matched_targets: Vec::new(),
        });
        Ok(self.codec.serialize(&response, &self.identity)?)
    }
}
