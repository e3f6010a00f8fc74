//! In-memory collaborators
//!
//! - [`InMemorySessionStore`]: principals keyed by session id, atomic per principal
//! - [`InMemoryPolicyStore`]: sequenced policy change log
//! - [`StaticMetadata`]: relying service metadata from configuration
//!
//! Used by the development binary and tests; production deployments put
//! real storage engines behind the same traits.

pub mod metadata;
pub mod policies;
pub mod sessions;

pub use metadata::StaticMetadata;
pub use policies::{InMemoryPolicyStore, PolicyStoreError};
pub use sessions::InMemorySessionStore;
