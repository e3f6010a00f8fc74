//! Session validation for the SSO stage
//!
//! Resolves the browser's session, applies forced re-authentication and
//! issues a per-service session index. Where no usable session exists and
//! the service forbids establishing one, a signed failure response is left
//! in the context for the caller to deliver.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use idp_common::protocol::{AuthnRequest, StatusCode, SubStatusCode};
use idp_common::{IdentifierGenerator, SessionError, SessionStore};
use tracing::{error, info, warn};

use crate::context::PipelineContext;
use crate::response::ResponseFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Principal resolved and a session index issued
    Established,
    NeedsAuthentication,
    /// Failure response stored in the context
    PassiveDenied,
    Failed,
}

pub struct SessionValidator {
    sessions: Arc<dyn SessionStore>,
    identifiers: Arc<dyn IdentifierGenerator>,
    responses: Arc<ResponseFactory>,
}

impl SessionValidator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        identifiers: Arc<dyn IdentifierGenerator>,
        responses: Arc<ResponseFactory>,
    ) -> Self {
        Self {
            sessions,
            identifiers,
            responses,
        }
    }

    pub async fn validate(&self, ctx: &mut PipelineContext, now: DateTime<Utc>) -> SessionOutcome {
        let remote = ctx.remote_address.clone().unwrap_or_default();

        let Some(request) = ctx.authn_request.clone() else {
            error!(remote = %remote, "No parsed request available for session validation");
            return SessionOutcome::Failed;
        };
        let Some(allow_create) = request.name_id_policy.as_ref().and_then(|p| p.allow_create) else {
            error!(remote = %remote, id = %request.header.id, "Request omitted its NameID policy");
            return SessionOutcome::Failed;
        };
        let service_id = request.header.issuer.clone();
        ctx.issuer_id = Some(service_id.clone());

        let session_id = match ctx.session_id.clone().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                return self.unestablished(
                    ctx,
                    &request,
                    allow_create,
                    StatusCode::Requester,
                    SubStatusCode::RequestDenied,
                    "Session could not be resolved and the service does not allow establishing one",
                );
            }
        };

        let principal = match self.sessions.query(&session_id).await {
            Ok(principal) if !principal.is_expired(now) => principal,
            Ok(_) | Err(SessionError::NotFound(_)) => {
                warn!(remote = %remote, "Presented session is unknown or expired");
                return self.unestablished(
                    ctx,
                    &request,
                    allow_create,
                    StatusCode::Responder,
                    SubStatusCode::AuthnFailed,
                    "Could not locate an active session for the presented identifier",
                );
            }
            Err(e) => {
                error!(remote = %remote, error = %e, "Session lookup failed");
                return SessionOutcome::Failed;
            }
        };

        if request.force_authn && principal.authn_age(now) > self.responses.allowed_time_skew() {
            if request.is_passive {
                info!(remote = %remote, service_id = %service_id, "Forced passive authentication is not supported");
                self.store_failure(
                    ctx,
                    &request,
                    StatusCode::Responder,
                    SubStatusCode::NoPassive,
                    "Passive only session establishment is not supported",
                );
                return SessionOutcome::PassiveDenied;
            }
            info!(remote = %remote, service_id = %service_id, "Service requested forced authentication");
            return SessionOutcome::NeedsAuthentication;
        }

        if principal.federated_identifier.is_empty() {
            error!(remote = %remote, "Principal has no federated identifier, terminating session");
            self.store_failure(
                ctx,
                &request,
                StatusCode::Responder,
                SubStatusCode::AuthnFailed,
                "The identifier for this principal is invalid",
            );
            if let Err(e) = self.sessions.terminate(&session_id).await {
                error!(error = %e, "Failed to terminate corrupt session");
            }
            return SessionOutcome::Failed;
        }

        let index = self.identifiers.generate_session_index();
        if let Err(e) = self
            .sessions
            .record_service_session_index(&principal, &service_id, &index)
            .await
        {
            error!(remote = %remote, error = %e, "Failed to record session index");
            return SessionOutcome::Failed;
        }

        info!(
            remote = %remote,
            service_id = %service_id,
            endpoint = ctx.response_endpoint.as_deref().unwrap_or(""),
            principal = %principal.local_principal_identifier,
            session_index = %index,
            "Session established for service"
        );

        let mut principal = principal;
        principal.add_service_session_index(&service_id, index.clone());
        ctx.principal = Some(principal);
        ctx.session_index = Some(index);
        SessionOutcome::Established
    }

    fn unestablished(
        &self,
        ctx: &mut PipelineContext,
        request: &AuthnRequest,
        allow_create: bool,
        code: StatusCode,
        sub_code: SubStatusCode,
        message: &str,
    ) -> SessionOutcome {
        if allow_create {
            return SessionOutcome::NeedsAuthentication;
        }
        if self.store_failure(ctx, request, code, sub_code, message) {
            SessionOutcome::PassiveDenied
        } else {
            SessionOutcome::Failed
        }
    }

    fn store_failure(
        &self,
        ctx: &mut PipelineContext,
        request: &AuthnRequest,
        code: StatusCode,
        sub_code: SubStatusCode,
        message: &str,
    ) -> bool {
        match self
            .responses
            .failure(request, ctx.response_endpoint.as_deref(), code, sub_code, message)
        {
            Ok(bytes) => {
                ctx.response_document = Some(bytes);
                true
            }
            Err(e) => {
                error!(error = %e, "Unable to sign failure response");
                false
            }
        }
    }
}
