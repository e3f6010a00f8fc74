//! Signed authentication responses
//!
//! Success responses carry one assertion:
//! - subject identifier chosen from the service's acceptable formats
//! - bearer confirmation bound to the response endpoint and session expiry
//! - conditions bounded by the allowed clock skew, audience = response endpoint
//! - authn statement with the issued session index

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use idp_common::protocol::{
    Assertion, AuthnRequest, AuthnStatement, Conditions, MessageHeader, NameId, Response, Status,
    StatusCode, SubStatusCode, Subject, SubjectConfirmation, BEARER_METHOD, EMAIL_FORMAT,
    PREVIOUS_SESSION_CONTEXT, TRANSIENT_FORMAT,
};
use idp_common::{
    CodecError, IdentifierGenerator, Principal, ProtocolMessage, SignedMessageCodec,
    SigningIdentity,
};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Result, SsoError};

#[derive(Debug, Clone)]
pub struct ResponseSettings {
    pub allowed_time_skew: Duration,
    /// Identifier format URI to the principal attribute holding its value
    pub identifier_format_attributes: IndexMap<String, String>,
    /// Issuers containing this marker always get an email local part
    pub vendor_override_marker: String,
    pub vendor_override_attribute: String,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        let mut identifier_format_attributes = IndexMap::new();
        identifier_format_attributes.insert(EMAIL_FORMAT.to_string(), "mail".to_string());
        Self {
            allowed_time_skew: Duration::from_secs(300),
            identifier_format_attributes,
            vendor_override_marker: "google".to_string(),
            vendor_override_attribute: "mail".to_string(),
        }
    }
}

pub struct ResponseFactory {
    codec: Arc<dyn SignedMessageCodec>,
    identity: SigningIdentity,
    issuer: String,
    identifiers: Arc<dyn IdentifierGenerator>,
    settings: ResponseSettings,
    skew: chrono::Duration,
}

impl ResponseFactory {
    pub fn new(
        codec: Arc<dyn SignedMessageCodec>,
        identity: SigningIdentity,
        issuer: impl Into<String>,
        identifiers: Arc<dyn IdentifierGenerator>,
        settings: ResponseSettings,
    ) -> Result<Self> {
        let skew = chrono::Duration::from_std(settings.allowed_time_skew)
            .map_err(|e| SsoError::configuration(format!("allowed time skew out of range: {}", e)))?;
        Ok(Self {
            codec,
            identity,
            issuer: issuer.into(),
            identifiers,
            settings,
            skew,
        })
    }

    pub fn allowed_time_skew(&self) -> chrono::Duration {
        self.skew
    }

    pub fn settings(&self) -> &ResponseSettings {
        &self.settings
    }

    /// Stored context class, or "previous session" once the authentication is older than the skew
    pub fn authn_context_class(&self, principal: &Principal, now: DateTime<Utc>) -> String {
        if principal.authn_age(now) > self.skew {
            PREVIOUS_SESSION_CONTEXT.to_string()
        } else {
            principal.authentication_context_class.clone()
        }
    }

    pub fn select_identifier(&self, service_issuer: &str, formats: &[String], principal: &Principal) -> NameId {
        let resolved = if !self.settings.vendor_override_marker.is_empty()
            && service_issuer.contains(&self.settings.vendor_override_marker)
        {
            self.vendor_identifier(principal)
        } else {
            formats
                .iter()
                .find_map(|format| self.identifier_for_format(format, principal))
        };

        resolved.unwrap_or_else(|| NameId {
            format: TRANSIENT_FORMAT.to_string(),
            value: principal.federated_identifier.clone(),
        })
    }

    fn identifier_for_format(&self, format: &str, principal: &Principal) -> Option<NameId> {
        if format == TRANSIENT_FORMAT {
            return Some(NameId {
                format: TRANSIENT_FORMAT.to_string(),
                value: principal.federated_identifier.clone(),
            });
        }
        let attribute = self.settings.identifier_format_attributes.get(format)?;
        let value = principal.first_attribute_value(attribute)?;
        Some(NameId {
            format: format.to_string(),
            value: value.to_string(),
        })
    }

    fn vendor_identifier(&self, principal: &Principal) -> Option<NameId> {
        let address = principal.first_attribute_value(&self.settings.vendor_override_attribute)?;
        let local_part = address.split('@').next().unwrap_or(address);
        if local_part.is_empty() {
            return None;
        }
        Some(NameId {
            format: EMAIL_FORMAT.to_string(),
            value: local_part.to_string(),
        })
    }

    pub fn success(
        &self,
        request: &AuthnRequest,
        endpoint: &str,
        formats: &[String],
        principal: &Principal,
        session_index: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<u8>, CodecError> {
        let name_id = self.select_identifier(&request.header.issuer, formats, principal);
        debug!(
            service_id = %request.header.issuer,
            format = %name_id.format,
            "Issuing assertion"
        );

        let assertion = Assertion {
            header: self.header(now),
            subject: Subject {
                name_id,
                confirmation: SubjectConfirmation {
                    method: BEARER_METHOD.to_string(),
                    recipient: endpoint.to_string(),
                    in_response_to: request.header.id.clone(),
                    not_on_or_after: principal.session_expiry,
                },
            },
            conditions: Conditions {
                not_before: now - self.skew,
                not_on_or_after: now + self.skew,
                audiences: vec![endpoint.to_string()],
            },
            authn_statement: AuthnStatement {
                authn_instant: now,
                session_index: session_index.to_string(),
                context_class: self.authn_context_class(principal, now),
            },
        };

        let response = ProtocolMessage::Response(Response {
            header: self.header(now),
            in_response_to: Some(request.header.id.clone()),
            destination: Some(endpoint.to_string()),
            status: Status::success(),
            assertion: Some(assertion),
        });
        self.codec.serialize(&response, &self.identity)
    }

    pub fn failure(
        &self,
        request: &AuthnRequest,
        endpoint: Option<&str>,
        code: StatusCode,
        sub_code: SubStatusCode,
        message: &str,
    ) -> std::result::Result<Vec<u8>, CodecError> {
        let response = ProtocolMessage::Response(Response {
            header: self.header(Utc::now()),
            in_response_to: Some(request.header.id.clone()),
            destination: endpoint.map(str::to_string),
            status: Status::failure(code, sub_code, message),
            assertion: None,
        });
        self.codec.serialize(&response, &self.identity)
    }

    fn header(&self, now: DateTime<Utc>) -> MessageHeader {
        MessageHeader::new(self.identifiers.generate_message_id(), self.issuer.clone(), now)
    }
}
