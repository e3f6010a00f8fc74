use idp_common::{CodecError, MetadataError, SessionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SsoError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl SsoError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LogoutError {
    #[error("No active session for {0}")]
    InvalidSession(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, SsoError>;
