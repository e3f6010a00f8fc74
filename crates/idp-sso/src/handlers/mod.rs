//! Built-in pipeline handlers

mod authn_request;
mod signed_response;

pub use authn_request::AuthnRequestHandler;
pub use signed_response::SignedResponseHandler;
