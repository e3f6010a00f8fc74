//! Error types shared by the core and its collaborators

use thiserror::Error;

/// Failures raised by a [`SignedMessageCodec`](crate::SignedMessageCodec)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Signing reference invalid: {0}")]
    ReferenceInvalid(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown endpoint {endpoint} for service {service_id}")]
    UnknownEndpoint { service_id: String, endpoint: String },
}

impl MetadataError {
    pub fn unknown_endpoint(service_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::UnknownEndpoint {
            service_id: service_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session store error: {0}")]
    Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Policy store unavailable: {0}")]
    Unavailable(String),

    #[error("Policy store query failed: {0}")]
    Query(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Timed out sending to {endpoint}")]
    Timeout { endpoint: String },

    #[error("Connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Endpoint {endpoint} answered with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Transport error: {0}")]
    Other(String),
}

/// Umbrella error for callers that mix collaborators
#[derive(Error, Debug)]
pub enum IdpError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IdpError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
