//! Shared types for the identity provider core
//!
//! Provides:
//! - Principal/session and policy cache records
//! - The protocol message model exchanged with relying services
//! - Collaborator traits (codec, metadata, sessions, policy store, transport)
//! - Identifier generation and tracing setup

pub mod collaborators;
pub mod error;
pub mod identifier;
pub mod logging;
pub mod model;
pub mod protocol;

pub use collaborators::{
    EndpointRef, MetadataResolver, OutboundTransport, PolicyDurableStore, SessionStore,
    SignedMessageCodec, SigningIdentity, VerifyWith,
};
pub use error::{
    CodecError, IdpError, MetadataError, SessionError, StoreError, TransportError,
};
pub use identifier::{IdentifierGenerator, RandomIdentifierGenerator};
pub use model::{
    AttributeRecord, Decision, FailedDelivery, NewSession, PolicyAction, PolicyCacheEntry,
    PolicyChange, Principal,
};
pub use protocol::ProtocolMessage;

pub type Result<T> = std::result::Result<T, IdpError>;
