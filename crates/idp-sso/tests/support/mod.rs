//! Shared mocks for the SSO integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;

use idp_codec::{HmacJsonCodec, StaticKeyResolver};
use idp_common::protocol::{
    AuthnRequest, MessageHeader, NameIdPolicy, Status, StatusResponse, EMAIL_FORMAT, TRANSIENT_FORMAT,
};
use idp_common::{
    EndpointRef, MetadataError, MetadataResolver, NewSession, OutboundTransport, Principal,
    ProtocolMessage, RandomIdentifierGenerator, SessionError, SessionStore, SignedMessageCodec,
    SigningIdentity, TransportError, VerifyWith,
};
use idp_sso::{ResponseFactory, ResponseSettings, SessionValidator};

pub const ISSUER: &str = "https://idp.example.edu";
pub const ACS: &str = "https://spep.example.edu/acs";

pub fn codec() -> Arc<HmacJsonCodec> {
    let keys = StaticKeyResolver::new()
        .with_key("idp", b"idp-secret".to_vec())
        .with_key("spep:1", b"spep-secret".to_vec());
    Arc::new(HmacJsonCodec::new(Arc::new(keys)))
}

pub fn principal(session_id: &str, authenticated: DateTime<Utc>) -> Principal {
    Principal {
        session_id: session_id.to_string(),
        federated_identifier: "_fed".to_string(),
        local_principal_identifier: "beddoes".to_string(),
        authn_timestamp: authenticated,
        session_expiry: authenticated + Duration::hours(8),
        authentication_context_class: "password".to_string(),
        attributes: IndexMap::new(),
        service_session_indices: IndexMap::new(),
    }
    .with_attribute("mail", vec!["beddoes@example.edu"])
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Default)]
pub struct MockSessions {
    pub principals: Mutex<IndexMap<String, Principal>>,
    pub terminated: Mutex<Vec<String>>,
}

impl MockSessions {
    pub fn with(principals: Vec<Principal>) -> Arc<Self> {
        let sessions = Self::default();
        for principal in principals {
            sessions
                .principals
                .lock()
                .insert(principal.session_id.clone(), principal);
        }
        Arc::new(sessions)
    }

    pub fn get(&self, session_id: &str) -> Option<Principal> {
        self.principals.lock().get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MockSessions {
    async fn query(&self, session_id: &str) -> Result<Principal, SessionError> {
        self.get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn query_by_federated_identifier(&self, federated_identifier: &str) -> Result<Principal, SessionError> {
        self.principals
            .lock()
            .values()
            .find(|p| p.federated_identifier == federated_identifier)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(federated_identifier.to_string()))
    }

    async fn create(&self, _session: NewSession) -> Result<Principal, SessionError> {
        Err(SessionError::Store("not supported".to_string()))
    }

    async fn record_service_session_index(&self, principal: &Principal, service_id: &str, index: &str) -> Result<(), SessionError> {
        let mut principals = self.principals.lock();
        let stored = principals
            .get_mut(&principal.session_id)
            .ok_or_else(|| SessionError::NotFound(principal.session_id.clone()))?;
        stored.add_service_session_index(service_id, index);
        Ok(())
    }

    async fn terminate(&self, session_id: &str) -> Result<(), SessionError> {
        self.principals.lock().shift_remove(session_id);
        self.terminated.lock().push(session_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[derive(Default)]
pub struct MockMetadata {
    pub logout_endpoints: Mutex<IndexMap<String, Vec<String>>>,
}

impl MockMetadata {
    pub fn with_logout(service_id: &str, endpoints: &[&str]) -> Self {
        let metadata = Self::default();
        metadata.add_logout(service_id, endpoints);
        metadata
    }

    pub fn add_logout(&self, service_id: &str, endpoints: &[&str]) {
        self.logout_endpoints.lock().insert(
            service_id.to_string(),
            endpoints.iter().map(|e| e.to_string()).collect(),
        );
    }
}

impl MetadataResolver for MockMetadata {
    fn is_known_service(&self, service_id: &str) -> bool {
        service_id.starts_with("spep:")
    }

    fn resolve_response_endpoint(&self, service_id: &str, endpoint: &EndpointRef) -> Result<String, MetadataError> {
        match endpoint {
            EndpointRef::Index(0) => Ok(ACS.to_string()),
            EndpointRef::Url(url) if url == ACS => Ok(ACS.to_string()),
            other => Err(MetadataError::unknown_endpoint(service_id, other.to_string())),
        }
    }

    fn resolve_logout_endpoints(&self, service_id: &str) -> Result<Vec<String>, MetadataError> {
        Ok(self
            .logout_endpoints
            .lock()
            .get(service_id)
            .cloned()
            .unwrap_or_default())
    }

    fn resolve_acceptable_identifier_formats(&self, _service_id: &str) -> Result<Vec<String>, MetadataError> {
        Ok(vec![EMAIL_FORMAT.to_string(), TRANSIENT_FORMAT.to_string()])
    }

    fn resolve_cache_clear_endpoints(&self, _service_id: &str) -> Result<BTreeMap<u32, String>, MetadataError> {
        Ok(BTreeMap::new())
    }
}

// ============================================================================
// Relying services
// ============================================================================

/// Answers logout requests with a signed status; some endpoints are down
pub struct MockServices {
    pub codec: Arc<HmacJsonCodec>,
    pub down: Mutex<HashSet<String>>,
    pub received: Mutex<Vec<(String, ProtocolMessage)>>,
}

impl MockServices {
    pub fn new(codec: Arc<HmacJsonCodec>) -> Arc<Self> {
        Arc::new(Self {
            codec,
            down: Mutex::new(HashSet::new()),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn take_down(&self, endpoint: &str) {
        self.down.lock().insert(endpoint.to_string());
    }

    pub fn bring_up(&self, endpoint: &str) {
        self.down.lock().remove(endpoint);
    }
}

#[async_trait]
impl OutboundTransport for MockServices {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.down.lock().contains(endpoint) {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let request = self
            .codec
            .deserialize(payload, &VerifyWith::Key("idp".to_string()))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let in_response_to = request.header().id.clone();
        self.received.lock().push((endpoint.to_string(), request));

        let reply = ProtocolMessage::LogoutResponse(StatusResponse {
            header: MessageHeader::new("_reply", "spep:1", Utc::now()),
            in_response_to: Some(in_response_to),
            status: Status::success(),
        });
        self.codec
            .serialize(&reply, &SigningIdentity::new("spep:1"))
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn responses(codec: Arc<HmacJsonCodec>) -> Arc<ResponseFactory> {
    Arc::new(
        ResponseFactory::new(
            codec,
            SigningIdentity::new("idp"),
            ISSUER,
            Arc::new(RandomIdentifierGenerator),
            ResponseSettings::default(),
        )
        .unwrap(),
    )
}

pub fn validator(sessions: Arc<MockSessions>, codec: Arc<HmacJsonCodec>) -> SessionValidator {
    SessionValidator::new(sessions, Arc::new(RandomIdentifierGenerator), responses(codec))
}

pub fn authn_request(issuer: &str, allow_create: bool) -> AuthnRequest {
    AuthnRequest {
        header: MessageHeader::new("_request", issuer, Utc::now()),
        name_id_policy: Some(NameIdPolicy {
            format: None,
            allow_create: Some(allow_create),
        }),
        force_authn: false,
        is_passive: false,
        assertion_consumer_service_index: Some(0),
        assertion_consumer_service_url: None,
    }
}

pub fn signed_request(codec: &HmacJsonCodec, request: AuthnRequest) -> Vec<u8> {
    codec
        .serialize(&ProtocolMessage::AuthnRequest(request), &SigningIdentity::new("spep:1"))
        .unwrap()
}

/// Decode a response this provider signed
pub fn decode_response(codec: &HmacJsonCodec, bytes: &[u8]) -> idp_common::protocol::Response {
    match codec.deserialize(bytes, &VerifyWith::Key("idp".to_string())).unwrap() {
        ProtocolMessage::Response(response) => response,
        other => panic!("unexpected {}", other.kind()),
    }
}
