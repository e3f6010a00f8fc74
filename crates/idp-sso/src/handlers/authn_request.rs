use std::sync::Arc;

use async_trait::async_trait;
use idp_common::{EndpointRef, MetadataResolver, ProtocolMessage, SignedMessageCodec, VerifyWith};
use tracing::{debug, warn};

use crate::context::PipelineContext;
use crate::handler::{Handler, RequestOutcome};

/// Verifies the raw request and resolves where the response must go
pub struct AuthnRequestHandler {
    codec: Arc<dyn SignedMessageCodec>,
    metadata: Arc<dyn MetadataResolver>,
}

impl AuthnRequestHandler {
    pub const NAME: &'static str = "signed-authn-request";

    pub fn new(codec: Arc<dyn SignedMessageCodec>, metadata: Arc<dyn MetadataResolver>) -> Self {
        Self { codec, metadata }
    }
}

#[async_trait]
impl Handler for AuthnRequestHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute_request(&self, ctx: &mut PipelineContext) -> RequestOutcome {
        if ctx.authn_request.is_some() {
            return RequestOutcome::NoAction;
        }
        let Some(document) = ctx.request_document.as_deref() else {
            return RequestOutcome::NoAction;
        };
        let remote = ctx.remote_address.as_deref().unwrap_or("");

        let request = match self.codec.deserialize(document, &VerifyWith::Resolver) {
            Ok(ProtocolMessage::AuthnRequest(request)) => request,
            Ok(other) => {
                warn!(remote, kind = other.kind(), "Expected an authentication request");
                return RequestOutcome::InvalidRequest;
            }
            Err(e) => {
                warn!(remote, error = %e, "Rejecting unverifiable authentication request");
                return RequestOutcome::InvalidRequest;
            }
        };

        let service_id = request.header.issuer.clone();
        if !self.metadata.is_known_service(&service_id) {
            warn!(remote, service_id = %service_id, "Authentication request from unknown service");
            return RequestOutcome::InvalidRequest;
        }

        let resolved = match (
            request.assertion_consumer_service_index,
            request.assertion_consumer_service_url.as_deref(),
        ) {
            (Some(index), _) => self
                .metadata
                .resolve_response_endpoint(&service_id, &EndpointRef::Index(index))
                .and_then(|endpoint| {
                    self.metadata
                        .resolve_acceptable_identifier_formats(&service_id)
                        .map(|formats| (endpoint, formats))
                }),
            (None, Some(url)) => self
                .metadata
                .resolve_response_endpoint(&service_id, &EndpointRef::Url(url.to_string()))
                .map(|endpoint| {
                    let formats = request
                        .name_id_policy
                        .as_ref()
                        .and_then(|policy| policy.format.clone())
                        .into_iter()
                        .collect();
                    (endpoint, formats)
                }),
            (None, None) => {
                warn!(remote, service_id = %service_id, "Request names no response endpoint");
                return RequestOutcome::InvalidRequest;
            }
        };

        let (endpoint, formats) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(remote, error = %e, "Unable to resolve response endpoint");
                return RequestOutcome::InvalidRequest;
            }
        };

        debug!(remote, service_id = %service_id, endpoint = %endpoint, "Authentication request accepted");
        ctx.issuer_id = Some(service_id);
        ctx.response_endpoint = Some(endpoint);
        ctx.identifier_formats = formats;
        ctx.authn_request = Some(request);
        RequestOutcome::Successful
    }
}
