//! Signed attribute query handling
//!
//! Relying services ask for a principal's attributes by federated identifier.
//! The answer carries every attribute the session holds, or only the ones the
//! query names. Protocol failures are answered with a signed failure status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use idp_common::protocol::{
    Attribute, AttributeAssertion, AttributeQuery, AttributeResponse, MessageHeader, Status, StatusCode,
    SubStatusCode,
};
use idp_common::{
    IdentifierGenerator, MetadataResolver, Principal, ProtocolMessage, SessionError, SessionStore,
    SignedMessageCodec, SigningIdentity, VerifyWith,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SsoError};

pub struct AttributeAuthorityProcessor {
    sessions: Arc<dyn SessionStore>,
    metadata: Arc<dyn MetadataResolver>,
    codec: Arc<dyn SignedMessageCodec>,
    identity: SigningIdentity,
    issuer: String,
    identifiers: Arc<dyn IdentifierGenerator>,
    skew: chrono::Duration,
}

impl AttributeAuthorityProcessor {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        metadata: Arc<dyn MetadataResolver>,
        codec: Arc<dyn SignedMessageCodec>,
        identity: SigningIdentity,
        issuer: impl Into<String>,
        identifiers: Arc<dyn IdentifierGenerator>,
        allowed_time_skew: Duration,
    ) -> Result<Self> {
        let skew = chrono::Duration::from_std(allowed_time_skew)
            .map_err(|e| SsoError::configuration(format!("allowed time skew out of range: {}", e)))?;
        Ok(Self {
            sessions,
            metadata,
            codec,
            identity,
            issuer: issuer.into(),
            identifiers,
            skew,
        })
    }

    /// Answer a signed attribute query; errors only if the answer cannot be signed
    pub async fn process_query(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let query = match self.codec.deserialize(bytes, &VerifyWith::Resolver) {
            Ok(ProtocolMessage::AttributeQuery(query)) => query,
            Ok(other) => {
                warn!(kind = other.kind(), "Expected an attribute query");
                return self.failure(
                    Some(other.header().id.clone()),
                    StatusCode::Requester,
                    SubStatusCode::RequestDenied,
                    "Message is not an attribute query",
                );
            }
            Err(e) => {
                warn!(error = %e, "Rejecting unverifiable attribute query");
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
            warn!(service_id = %service_id, "Attribute query from unknown service");
            return self.failure(
                Some(query.header.id),
                StatusCode::Requester,
                SubStatusCode::RequestDenied,
                "Issuer is not a known service",
            );
        }
        if query.subject.is_empty() {
            warn!(service_id = %service_id, "Attribute query without a subject");
            return self.failure(
                Some(query.header.id),
                StatusCode::Requester,
                SubStatusCode::RequestDenied,
                "Query does not name a subject",
            );
        }

        let principal = match self.sessions.query_by_federated_identifier(&query.subject).await {
            Ok(principal) if !principal.is_expired(Utc::now()) => principal,
            Ok(_) | Err(SessionError::NotFound(_)) => {
                info!(service_id = %service_id, "Attribute query for unknown or expired principal");
                return self.failure(
                    Some(query.header.id),
                    StatusCode::Responder,
                    SubStatusCode::AuthnFailed,
                    "Principal has no active session",
                );
            }
            Err(e) => {
                warn!(error = %e, "Session store failure during attribute query");
                return self.failure(
                    Some(query.header.id),
                    StatusCode::Responder,
                    SubStatusCode::RequestDenied,
                    "Session lookup failed",
                );
            }
        };

        let attributes = released_attributes(&query, &principal);
        info!(
            service_id = %service_id,
            requested = query.attributes.len(),
            released = attributes.len(),
            "Attribute query answered"
        );

        let now = Utc::now();
        let response = ProtocolMessage::AttributeResponse(AttributeResponse {
            header: self.header(),
            in_response_to: Some(query.header.id.clone()),
            status: Status::success(),
            assertion: Some(AttributeAssertion {
                header: self.header(),
                subject: query.subject,
                in_response_to: query.header.id,
                not_on_or_after: now + self.skew,
                attributes,
            }),
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
        let response = ProtocolMessage::AttributeResponse(AttributeResponse {
            header: self.header(),
            in_response_to,
            status: Status::failure(code, sub_code, message),
            assertion: None,
        });
        Ok(self.codec.serialize(&response, &self.identity)?)
    }
}

/// Every attribute when nothing is named, otherwise the named ones the principal holds
fn released_attributes(query: &AttributeQuery, principal: &Principal) -> Vec<Attribute> {
    if query.attributes.is_empty() {
        return principal
            .attributes
            .iter()
            .map(|(name, record)| Attribute {
                name: name.clone(),
                friendly_name: None,
                values: record.values.clone(),
            })
            .collect();
    }

    query
        .attributes
        .iter()
        .filter_map(|requested| match principal.attributes.get(&requested.name) {
            Some(record) => Some(Attribute {
                name: requested.name.clone(),
                friendly_name: requested.friendly_name.clone(),
                values: record.values.clone(),
            }),
            None => {
                debug!(attribute = %requested.name, "Requested attribute not held by principal");
                None
            }
        })
        .collect()
}
