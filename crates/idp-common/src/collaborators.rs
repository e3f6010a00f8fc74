//! Collaborator traits consumed by the core
//!
//! Storage engines, the signing codec and the outbound transport live behind
//! these seams and are injected as `Arc<dyn Trait>`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{CodecError, MetadataError, SessionError, StoreError, TransportError};
use crate::model::{NewSession, PolicyCacheEntry, PolicyChange, Principal};
use crate::protocol::ProtocolMessage;

/// Key used to sign outgoing messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub key_name: String,
}

impl SigningIdentity {
    pub fn new(key_name: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
        }
    }
}

/// How an inbound signature is checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyWith {
    /// Only the named key is acceptable
    Key(String),
    /// Resolve the signer from the key name embedded in the message
    Resolver,
}

pub trait SignedMessageCodec: Send + Sync {
    fn serialize(
        &self,
        message: &ProtocolMessage,
        identity: &SigningIdentity,
    ) -> Result<Vec<u8>, CodecError>;

    fn deserialize(&self, bytes: &[u8], verify: &VerifyWith) -> Result<ProtocolMessage, CodecError>;
}

/// Reference to a relying service endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointRef {
    Index(u32),
    Url(String),
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRef::Index(index) => write!(f, "index {}", index),
            EndpointRef::Url(url) => write!(f, "{}", url),
        }
    }
}

/// Read-only view over relying service metadata
pub trait MetadataResolver: Send + Sync {
    fn is_known_service(&self, service_id: &str) -> bool;

    fn resolve_response_endpoint(
        &self,
        service_id: &str,
        endpoint: &EndpointRef,
    ) -> Result<String, MetadataError>;

    fn resolve_logout_endpoints(&self, service_id: &str) -> Result<Vec<String>, MetadataError>;

    fn resolve_acceptable_identifier_formats(
        &self,
        service_id: &str,
    ) -> Result<Vec<String>, MetadataError>;

    /// Cache-clear endpoints keyed by endpoint index
    fn resolve_cache_clear_endpoints(
        &self,
        service_id: &str,
    ) -> Result<BTreeMap<u32, String>, MetadataError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn query(&self, session_id: &str) -> Result<Principal, SessionError>;

    async fn query_by_federated_identifier(
        &self,
        federated_identifier: &str,
    ) -> Result<Principal, SessionError>;

    async fn create(&self, session: NewSession) -> Result<Principal, SessionError>;

    /// Append a session index for a service; atomic per principal
    async fn record_service_session_index(
        &self,
        principal: &Principal,
        service_id: &str,
        index: &str,
    ) -> Result<(), SessionError>;

    async fn terminate(&self, session_id: &str) -> Result<(), SessionError>;
}

#[async_trait]
pub trait PolicyDurableStore: Send + Sync {
    async fn max_sequence_id(&self) -> Result<i64, StoreError>;

    async fn fetch_changes_since(&self, sequence_id: i64) -> Result<Vec<PolicyChange>, StoreError>;

    async fn fetch_all(&self) -> Result<Vec<PolicyCacheEntry>, StoreError>;
}

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError>;
}
