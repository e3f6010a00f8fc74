//! Resumable SSO state machine
//!
//! Stages run in order:
//! - request processing: registered request handlers, skip-until-marker on resume
//! - SSO processing: [`SessionValidator`]
//! - response processing: registered response handlers
//!
//! The stage and the handler about to run are written into the context
//! before each step, so a context persisted mid-transaction resumes at the
//! handler it stopped on without re-running earlier ones.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::context::{PipelineContext, PipelineResult, Stage};
use crate::error::{Result, SsoError};
use crate::handler::{Handler, RequestOutcome, ResponseOutcome};
use crate::session::{SessionOutcome, SessionValidator};

/// Request handler restarts allowed in one call
pub const MAX_RESETS: usize = 8;

enum RequestFlow {
    Advance,
    Restart,
    Finish(PipelineResult),
}

pub struct SsoPipeline {
    request_handlers: Vec<Arc<dyn Handler>>,
    validator: SessionValidator,
    response_handlers: Vec<Arc<dyn Handler>>,
}

impl SsoPipeline {
    pub fn new(
        request_handlers: Vec<Arc<dyn Handler>>,
        validator: SessionValidator,
        response_handlers: Vec<Arc<dyn Handler>>,
    ) -> Result<Self> {
        check_handlers("request", &request_handlers)?;
        check_handlers("response", &response_handlers)?;
        Ok(Self {
            request_handlers,
            validator,
            response_handlers,
        })
    }

    pub async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult {
        if ctx.invalidated {
            warn!("Refusing to execute an invalidated context");
            return PipelineResult::Failed;
        }
        if ctx.current_stage == Stage::None {
            ctx.current_stage = Stage::RequestProcessing;
            ctx.current_handler = None;
        }

        let mut restarts = 0;
        loop {
            match ctx.current_stage {
                Stage::RequestProcessing => {
                    let Some(start) = resume_position(&self.request_handlers, ctx) else {
                        return corrupted(ctx);
                    };
                    match self.run_request_handlers(start, ctx).await {
                        RequestFlow::Advance => {
                            ctx.current_stage = Stage::SsoProcessing;
                            ctx.current_handler = None;
                        }
                        RequestFlow::Restart => {
                            restarts += 1;
                            if restarts > MAX_RESETS {
                                warn!(restarts, "Request handlers kept resetting, giving up");
                                ctx.complete();
                                return PipelineResult::Failed;
                            }
                        }
                        RequestFlow::Finish(result) => {
                            ctx.complete();
                            return result;
                        }
                    }
                }
                Stage::SsoProcessing => {
                    // no handlers are registered for this stage
                    if ctx.current_handler.is_some() {
                        return corrupted(ctx);
                    }
                    match self.validator.validate(ctx, Utc::now()).await {
                        SessionOutcome::Established => {
                            ctx.current_stage = Stage::ResponseProcessing;
                        }
                        SessionOutcome::NeedsAuthentication => {
                            return PipelineResult::NeedsFreshAuthentication;
                        }
                        SessionOutcome::PassiveDenied => {
                            ctx.complete();
                            return PipelineResult::NeedsFreshAuthenticationPassiveDenied;
                        }
                        SessionOutcome::Failed => {
                            ctx.complete();
                            return PipelineResult::Failed;
                        }
                    }
                }
                Stage::ResponseProcessing => {
                    let Some(start) = resume_position(&self.response_handlers, ctx) else {
                        return corrupted(ctx);
                    };
                    let result = self.run_response_handlers(start, ctx).await;
                    ctx.complete();
                    return result;
                }
                Stage::None => return corrupted(ctx),
            }
        }
    }

    async fn run_request_handlers(&self, start: usize, ctx: &mut PipelineContext) -> RequestFlow {
        for handler in &self.request_handlers[start..] {
            ctx.current_handler = Some(handler.name().to_string());
            let outcome = handler.execute_request(ctx).await;
            debug!(handler = handler.name(), outcome = ?outcome, "Request handler finished");

            match outcome {
                RequestOutcome::InvalidRequest => {
                    warn!(handler = handler.name(), "Request rejected");
                    return RequestFlow::Finish(PipelineResult::Failed);
                }
                RequestOutcome::NoAction => ctx.current_handler = None,
                RequestOutcome::Successful => return RequestFlow::Advance,
                RequestOutcome::Reset => {
                    ctx.current_handler = None;
                    return RequestFlow::Restart;
                }
            }
        }
        warn!("No request handler accepted the request");
        RequestFlow::Finish(PipelineResult::Failed)
    }

    async fn run_response_handlers(&self, start: usize, ctx: &mut PipelineContext) -> PipelineResult {
        for handler in &self.response_handlers[start..] {
            ctx.current_handler = Some(handler.name().to_string());
            let outcome = handler.execute_response(ctx).await;
            debug!(handler = handler.name(), outcome = ?outcome, "Response handler finished");

            match outcome {
                ResponseOutcome::InvalidRequest | ResponseOutcome::UnwillingToRespond => {
                    warn!(handler = handler.name(), outcome = ?outcome, "Response generation failed");
                    return PipelineResult::Failed;
                }
                ResponseOutcome::NoAction => ctx.current_handler = None,
                ResponseOutcome::Successful => {
                    info!(handler = handler.name(), "Response generated");
                    return PipelineResult::Successful;
                }
            }
        }
        warn!("No response handler produced a response");
        PipelineResult::Failed
    }
}

fn check_handlers(stage: &str, handlers: &[Arc<dyn Handler>]) -> Result<()> {
    if handlers.is_empty() {
        return Err(SsoError::configuration(format!("no {} handlers registered", stage)));
    }
    let mut seen = HashSet::new();
    for handler in handlers {
        if !seen.insert(handler.name()) {
            return Err(SsoError::configuration(format!(
                "duplicate {} handler name: {}",
                stage,
                handler.name()
            )));
        }
    }
    Ok(())
}

/// Index to resume from, `None` when the marker names no registered handler
fn resume_position(handlers: &[Arc<dyn Handler>], ctx: &PipelineContext) -> Option<usize> {
    match ctx.current_handler.as_deref() {
        None => Some(0),
        Some(name) => handlers.iter().position(|h| h.name() == name),
    }
}

fn corrupted(ctx: &mut PipelineContext) -> PipelineResult {
    error!(
        stage = %ctx.current_stage,
        handler = ctx.current_handler.as_deref().unwrap_or(""),
        remote = ctx.remote_address.as_deref().unwrap_or(""),
        "Pipeline context does not match registered handlers, invalidating"
    );
    ctx.invalidate();
    PipelineResult::Failed
}
