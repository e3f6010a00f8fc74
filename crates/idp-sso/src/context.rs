//! Per-transaction pipeline state
//!
//! The caller owns the context and stores it between calls (usually in its
//! own web session). It is serialisable so it can be persisted as JSON.

use idp_common::protocol::AuthnRequest;
use idp_common::Principal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    #[default]
    None,
    RequestProcessing,
    SsoProcessing,
    ResponseProcessing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::None => "none",
            Stage::RequestProcessing => "request-processing",
            Stage::SsoProcessing => "sso-processing",
            Stage::ResponseProcessing => "response-processing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineResult {
    Successful,
    Failed,
    /// Send the browser to authenticate, then call again with the same context
    NeedsFreshAuthentication,
    /// A signed failure response is ready in the context
    NeedsFreshAuthenticationPassiveDenied,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    pub current_stage: Stage,
    /// When set, names a handler registered for `current_stage`
    pub current_handler: Option<String>,

    pub remote_address: Option<String>,
    /// Session identifier presented by the browser
    pub session_id: Option<String>,

    pub request_document: Option<Vec<u8>>,
    pub authn_request: Option<AuthnRequest>,
    pub issuer_id: Option<String>,
    pub response_endpoint: Option<String>,
    /// Candidate subject identifier formats, in preference order
    pub identifier_formats: Vec<String>,

    pub principal: Option<Principal>,
    pub session_index: Option<String>,
    pub response_document: Option<Vec<u8>>,

    /// Set when the pipeline found the context out of step with its handlers.
    /// The caller must discard the stored copy.
    pub invalidated: bool,
}

impl PipelineContext {
    pub fn new(request_document: Vec<u8>) -> Self {
        Self {
            request_document: Some(request_document),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_remote_address(mut self, remote_address: impl Into<String>) -> Self {
        self.remote_address = Some(remote_address.into());
        self
    }

    /// Transaction finished; nothing left to resume
    pub fn complete(&mut self) {
        self.current_stage = Stage::None;
        self.current_handler = None;
    }

    /// Drop all transaction data and flag the context as unusable
    pub fn invalidate(&mut self) {
        let remote_address = self.remote_address.take();
        *self = Self {
            remote_address,
            invalidated: true,
            ..Default::default()
        };
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
