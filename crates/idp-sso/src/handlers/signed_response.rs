use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, warn};

use crate::context::PipelineContext;
use crate::handler::{Handler, ResponseOutcome};
use crate::response::ResponseFactory;

/// Produces the signed response once a session index has been issued
pub struct SignedResponseHandler {
    responses: Arc<ResponseFactory>,
}

impl SignedResponseHandler {
    pub const NAME: &'static str = "signed-response";

    pub fn new(responses: Arc<ResponseFactory>) -> Self {
        Self { responses }
    }
}

#[async_trait]
impl Handler for SignedResponseHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute_response(&self, ctx: &mut PipelineContext) -> ResponseOutcome {
        let Some(session_index) = ctx.session_index.as_deref() else {
            // a failure response left by session validation goes out unchanged
            return if ctx.response_document.is_some() {
                ResponseOutcome::Successful
            } else {
                ResponseOutcome::NoAction
            };
        };

        let (Some(request), Some(endpoint), Some(principal)) = (
            ctx.authn_request.as_ref(),
            ctx.response_endpoint.as_deref(),
            ctx.principal.as_ref(),
        ) else {
            warn!("Session index issued without request, endpoint or principal");
            return ResponseOutcome::InvalidRequest;
        };

        match self.responses.success(
            request,
            endpoint,
            &ctx.identifier_formats,
            principal,
            session_index,
            Utc::now(),
        ) {
            Ok(bytes) => {
                ctx.response_document = Some(bytes);
                ResponseOutcome::Successful
            }
            Err(e) => {
                error!(error = %e, "Unable to sign authentication response");
                ResponseOutcome::UnwillingToRespond
            }
        }
    }
}
