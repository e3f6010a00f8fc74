//! Protocol message model
//!
//! Only the fields the decision and delivery logic depends on are modelled.
//! Wire encoding belongs to the [`SignedMessageCodec`](crate::SignedMessageCodec).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Decision;

pub const TRANSIENT_FORMAT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
pub const EMAIL_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const PREVIOUS_SESSION_CONTEXT: &str = "urn:oasis:names:tc:SAML:2.0:ac:classes:PreviousSession";
pub const BEARER_METHOD: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Fields every protocol message carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub issuer: String,
}

impl MessageHeader {
    pub fn new(id: impl Into<String>, issuer: impl Into<String>, issue_instant: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            issue_instant,
            issuer: issuer.into(),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    Requester,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubStatusCode {
    RequestDenied,
    AuthnFailed,
    NoPassive,
    UnknownPrincipal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_code: Option<SubStatusCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            sub_code: None,
            message: None,
        }
    }

    pub fn failure(code: StatusCode, sub_code: SubStatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            sub_code: Some(sub_code),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

// ============================================================================
// Authentication
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameIdPolicy {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub allow_create: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthnRequest {
    pub header: MessageHeader,
    #[serde(default)]
    pub name_id_policy: Option<NameIdPolicy>,
    #[serde(default)]
    pub force_authn: bool,
    #[serde(default)]
    pub is_passive: bool,
    #[serde(default)]
    pub assertion_consumer_service_index: Option<u32>,
    #[serde(default)]
    pub assertion_consumer_service_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameId {
    pub format: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectConfirmation {
    pub method: String,
    pub recipient: String,
    pub in_response_to: String,
    pub not_on_or_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub name_id: NameId,
    pub confirmation: SubjectConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub audiences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthnStatement {
    pub authn_instant: DateTime<Utc>,
    pub session_index: String,
    pub context_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    pub header: MessageHeader,
    pub subject: Subject,
    pub conditions: Conditions,
    pub authn_statement: AuthnStatement,
}

/// Answer to an [`AuthnRequest`]; carries an assertion on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub header: MessageHeader,
    #[serde(default)]
    pub in_response_to: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub assertion: Option<Assertion>,
}

// ============================================================================
// Logout and cache invalidation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub header: MessageHeader,
    pub name_id: String,
    pub reason: String,
    #[serde(default)]
    pub session_indices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub header: MessageHeader,
    #[serde(default)]
    pub in_response_to: Option<String>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheRequest {
    pub header: MessageHeader,
    pub reason: String,
    /// Policy-level resource targets the service should re-query
    #[serde(default)]
    pub group_targets: Vec<String>,
}

// ============================================================================
// Authorization
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzDecisionQuery {
    pub header: MessageHeader,
    /// Federated identifier of the subject
    pub subject: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzDecisionResponse {
    pub header: MessageHeader,
    #[serde(default)]
    pub in_response_to: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub matched_targets: Vec<String>,
}

// ============================================================================
// Attribute queries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedAttribute {
    pub name: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeQuery {
    pub header: MessageHeader,
    /// Federated identifier of the subject
    pub subject: String,
    /// Empty asks for every attribute the principal holds
    #[serde(default)]
    pub attributes: Vec<RequestedAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeAssertion {
    pub header: MessageHeader,
    pub subject: String,
    pub in_response_to: String,
    pub not_on_or_after: DateTime<Utc>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeResponse {
    pub header: MessageHeader,
    #[serde(default)]
    pub in_response_to: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub assertion: Option<AttributeAssertion>,
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    AuthnRequest(AuthnRequest),
    Response(Response),
    LogoutRequest(LogoutRequest),
    LogoutResponse(StatusResponse),
    ClearCacheRequest(ClearCacheRequest),
    ClearCacheResponse(StatusResponse),
    AuthzDecisionQuery(AuthzDecisionQuery),
    AuthzDecisionResponse(AuthzDecisionResponse),
    AttributeQuery(AttributeQuery),
    AttributeResponse(AttributeResponse),
}

impl ProtocolMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            ProtocolMessage::AuthnRequest(m) => &m.header,
            ProtocolMessage::Response(m) => &m.header,
            ProtocolMessage::LogoutRequest(m) => &m.header,
            ProtocolMessage::LogoutResponse(m) => &m.header,
            ProtocolMessage::ClearCacheRequest(m) => &m.header,
            ProtocolMessage::ClearCacheResponse(m) => &m.header,
            ProtocolMessage::AuthzDecisionQuery(m) => &m.header,
            ProtocolMessage::AuthzDecisionResponse(m) => &m.header,
            ProtocolMessage::AttributeQuery(m) => &m.header,
            ProtocolMessage::AttributeResponse(m) => &m.header,
        }
    }

    fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            ProtocolMessage::AuthnRequest(m) => &mut m.header,
            ProtocolMessage::Response(m) => &mut m.header,
            ProtocolMessage::LogoutRequest(m) => &mut m.header,
            ProtocolMessage::LogoutResponse(m) => &mut m.header,
            ProtocolMessage::ClearCacheRequest(m) => &mut m.header,
            ProtocolMessage::ClearCacheResponse(m) => &mut m.header,
            ProtocolMessage::AuthzDecisionQuery(m) => &mut m.header,
            ProtocolMessage::AuthzDecisionResponse(m) => &mut m.header,
            ProtocolMessage::AttributeQuery(m) => &mut m.header,
            ProtocolMessage::AttributeResponse(m) => &mut m.header,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::AuthnRequest(_) => "AuthnRequest",
            ProtocolMessage::Response(_) => "Response",
            ProtocolMessage::LogoutRequest(_) => "LogoutRequest",
            ProtocolMessage::LogoutResponse(_) => "LogoutResponse",
            ProtocolMessage::ClearCacheRequest(_) => "ClearCacheRequest",
            ProtocolMessage::ClearCacheResponse(_) => "ClearCacheResponse",
            ProtocolMessage::AuthzDecisionQuery(_) => "AuthzDecisionQuery",
            ProtocolMessage::AuthzDecisionResponse(_) => "AuthzDecisionResponse",
            ProtocolMessage::AttributeQuery(_) => "AttributeQuery",
            ProtocolMessage::AttributeResponse(_) => "AttributeResponse",
        }
    }

    /// Replace the message id and issue instant ahead of a resend
    pub fn refresh(&mut self, id: impl Into<String>, issue_instant: DateTime<Utc>) {
        let header = self.header_mut();
        header.id = id.into();
        header.issue_instant = issue_instant;
    }

    /// Status of a response-type message, `None` for requests
    pub fn status(&self) -> Option<&Status> {
        match self {
            ProtocolMessage::Response(m) => Some(&m.status),
            ProtocolMessage::LogoutResponse(m) | ProtocolMessage::ClearCacheResponse(m) => {
                Some(&m.status)
            }
            ProtocolMessage::AuthzDecisionResponse(m) => Some(&m.status),
            ProtocolMessage::AttributeResponse(m) => Some(&m.status),
            _ => None,
        }
    }
}
