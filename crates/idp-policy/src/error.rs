use idp_common::{CodecError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy parse error: {0}")]
    Parse(String),

    #[error("Policy {policy_id} already cached for service {service_id}")]
    Duplicate { service_id: String, policy_id: String },

    #[error("Policy store has no policies yet (max sequence id {0})")]
    EmptyStore(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl PolicyError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
