use async_trait::async_trait;

use crate::context::PipelineContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Abort the transaction
    InvalidRequest,
    /// Nothing to do here, try the next handler
    NoAction,
    /// Request fully processed, move on to session validation
    Successful,
    /// Upstream state changed, restart from the first request handler
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    InvalidRequest,
    UnwillingToRespond,
    NoAction,
    Successful,
}

/// A step registered with the pipeline for the request and/or response stage.
///
/// Handler names must be unique within a stage; the name is what the
/// context records as its resume marker.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute_request(&self, _ctx: &mut PipelineContext) -> RequestOutcome {
        RequestOutcome::NoAction
    }

    async fn execute_response(&self, _ctx: &mut PipelineContext) -> ResponseOutcome {
        ResponseOutcome::NoAction
    }
}
