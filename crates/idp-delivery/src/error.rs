use idp_common::{CodecError, TransportError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Payload could not be regenerated: {0}")]
    Regeneration(CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Response could not be verified: {0}")]
    InvalidResponse(#[from] CodecError),

    #[error("Response rejected: {0}")]
    Rejected(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl DeliveryError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
