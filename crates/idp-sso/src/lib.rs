//! Single sign-on protocol pipeline
//!
//! - [`SsoPipeline`]: resumable request / session / response state machine
//! - [`Handler`]: capability implemented by request and response handlers
//! - [`SessionValidator`]: session lookup, forced re-authentication, index issuance
//! - [`ResponseFactory`]: signed success and failure responses
//! - [`LogoutService`]: best-effort logout fan-out to relying services
//! - [`AttributeAuthorityProcessor`]: signed answers to attribute queries
//!
//! The pipeline position lives in [`PipelineContext`], which the caller
//! persists between invocations so a transaction can suspend across a
//! browser redirect to a login form.

pub mod attribute_authority;
pub mod context;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod logout;
pub mod pipeline;
pub mod response;
pub mod session;

pub use attribute_authority::AttributeAuthorityProcessor;
pub use context::{PipelineContext, PipelineResult, Stage};
pub use error::{LogoutError, Result, SsoError};
pub use handler::{Handler, RequestOutcome, ResponseOutcome};
pub use handlers::{AuthnRequestHandler, SignedResponseHandler};
pub use logout::{LogoutService, LogoutState, LogoutStates};
pub use pipeline::{SsoPipeline, MAX_RESETS};
pub use response::{ResponseFactory, ResponseSettings};
pub use session::{SessionOutcome, SessionValidator};
