//! HTTP surface of the development server
//!
//! - `POST /sessions` - establish a session for a locally authenticated user
//! - `POST /sso` - run a signed authentication request through the pipeline
//! - `POST /sso/:transaction_id` - resume a transaction after fresh authentication
//! - `POST /logout/:session_id` - terminate a session and notify every service
//! - `POST /authz/query` - signed authorization query
//! - `POST /authz/decision` - unsigned decision lookup for local testing
//! - `POST /attributes/query` - signed attribute query
//! - `POST /services/:service_id/starting/:index` - relying service startup notice

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use idp_common::{AttributeRecord, IdentifierGenerator, NewSession, SessionStore};
use idp_delivery::RetryingDelivery;
use idp_policy::{AuthorizationProcessor, DecisionEngine, NotifyOutcome, PolicyCacheSynchronizer};
use idp_sso::{AttributeAuthorityProcessor, LogoutError, LogoutService, PipelineContext, PipelineResult, SsoPipeline};
use idp_store::InMemorySessionStore;

/// Header carrying the caller's session id on SSO requests
pub const SESSION_HEADER: &str = "x-idp-session";

/// Serialized pipeline context waiting for fresh authentication
pub struct SuspendedTransaction {
    pub context: Vec<u8>,
    pub suspended_at: DateTime<Utc>,
}

pub type SuspendedTransactions = DashMap<String, SuspendedTransaction>;

/// Drop transactions suspended longer than `max_age`; returns how many were removed
pub fn purge_suspended(suspended: &SuspendedTransactions, now: DateTime<Utc>, max_age: chrono::Duration) -> usize {
    let before = suspended.len();
    suspended.retain(|_, transaction| now - transaction.suspended_at <= max_age);
    let removed = before.saturating_sub(suspended.len());
    if removed > 0 {
        info!(count = removed, "Purged abandoned SSO transactions");
    }
    removed
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<InMemorySessionStore>,
    pub engine: Arc<DecisionEngine>,
    pub authz: Arc<AuthorizationProcessor>,
    pub attributes: Arc<AttributeAuthorityProcessor>,
    pub pipeline: Arc<SsoPipeline>,
    pub logout: Arc<LogoutService>,
    pub sync: Arc<PolicyCacheSynchronizer>,
    pub logout_retry: Arc<RetryingDelivery>,
    pub cache_retry: Arc<RetryingDelivery>,
    pub identifiers: Arc<dyn IdentifierGenerator>,
    pub suspended: Arc<SuspendedTransactions>,
    pub session_lifetime: chrono::Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", post(create_session))
        .route("/sso", post(sso))
        .route("/sso/:transaction_id", post(resume_sso))
        .route("/logout/:session_id", post(logout))
        .route("/authz/query", post(authz_query))
        .route("/authz/decision", post(authz_decision))
        .route("/attributes/query", post(attribute_query))
        .route("/services/:service_id/starting/:index", post(service_starting))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

// ============================================================================
// Health
// ============================================================================

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.sync.cache();
    Json(json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "policyCache": {
                "initialized": state.sync.is_initialized(),
                "lastSequenceId": state.sync.last_sequence_id(),
                "policies": cache.policy_count(),
            },
            "sessions": state.sessions.len(),
            "pendingLogoutDeliveries": state.logout_retry.pending(),
            "pendingCacheClearDeliveries": state.cache_retry.pending(),
            "suspendedTransactions": state.suspended.len(),
        }
    }))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    principal: String,
    #[serde(default = "default_context_class")]
    authentication_context_class: String,
    #[serde(default)]
    attributes: IndexMap<String, Vec<String>>,
}

fn default_context_class() -> String {
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport".to_string()
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let attributes = request
        .attributes
        .into_iter()
        .map(|(name, values)| (name, AttributeRecord::new(values).with_handler("idp-dev")))
        .collect();

    let created = state
        .sessions
        .create(NewSession {
            local_principal_identifier: request.principal,
            authentication_context_class: request.authentication_context_class,
            attributes,
            lifetime: state.session_lifetime,
        })
        .await;

    match created {
        Ok(principal) => (
            StatusCode::CREATED,
            Json(json!({
                "sessionId": principal.session_id,
                "federatedIdentifier": principal.federated_identifier,
                "expires": principal.session_expiry,
            })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

// ============================================================================
// SSO
// ============================================================================

async fn sso(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let mut ctx = PipelineContext::new(body.to_vec());
    if let Some(session_id) = header_value(&headers, SESSION_HEADER) {
        ctx = ctx.with_session_id(session_id);
    }
    if let Some(forwarded) = header_value(&headers, "x-forwarded-for") {
        ctx = ctx.with_remote_address(forwarded);
    }
    run_pipeline(&state, ctx).await
}

async fn resume_sso(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some((_, stored)) = state.suspended.remove(&transaction_id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown transaction");
    };
    let mut ctx = match PipelineContext::from_json(&stored.context) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(transaction_id, error = %e, "Suspended transaction could not be restored");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "transaction corrupted");
        }
    };
    // the user has just authenticated, so the session id changes
    if let Some(session_id) = header_value(&headers, SESSION_HEADER) {
        ctx.session_id = Some(session_id);
    }
    run_pipeline(&state, ctx).await
}

async fn run_pipeline(state: &AppState, mut ctx: PipelineContext) -> Response {
    match state.pipeline.execute(&mut ctx).await {
        PipelineResult::Successful | PipelineResult::NeedsFreshAuthenticationPassiveDenied => {
            match ctx.response_document.take() {
                Some(document) => (StatusCode::OK, document).into_response(),
                None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "no response document produced"),
            }
        }
        PipelineResult::NeedsFreshAuthentication => {
            let transaction_id = state.identifiers.generate_message_id();
            match ctx.to_json() {
                Ok(serialized) => {
                    state.suspended.insert(
                        transaction_id.clone(),
                        SuspendedTransaction {
                            context: serialized,
                            suspended_at: Utc::now(),
                        },
                    );
                    info!(transaction_id, "SSO transaction suspended for authentication");
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(json!({
                            "error": "authentication required",
                            "transactionId": transaction_id,
                        })),
                    )
                        .into_response()
                }
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
            }
        }
        PipelineResult::Failed => match ctx.response_document.take() {
            // a signed failure response is still deliverable to the service
            Some(document) => (StatusCode::OK, document).into_response(),
            None => error_response(StatusCode::BAD_REQUEST, "request could not be processed"),
        },
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Logout
// ============================================================================

async fn logout(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    match state.logout.logout(&session_id).await {
        Ok(states) => Json(states).into_response(),
        Err(LogoutError::InvalidSession(session_id)) => {
            error_response(StatusCode::NOT_FOUND, format!("no session {}", session_id))
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ============================================================================
// Authorization
// ============================================================================

async fn authz_query(State(state): State<AppState>, body: Bytes) -> Response {
    match state.authz.process_query(&body).await {
        Ok(document) => (StatusCode::OK, document).into_response(),
        Err(e) => {
            error!(error = %e, "Authorization response could not be produced");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionRequest {
    service_id: String,
    federated_identifier: String,
    resource: String,
}

async fn authz_decision(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    let principal = match state
        .sessions
        .query_by_federated_identifier(&request.federated_identifier)
        .await
    {
        Ok(principal) => principal,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e),
    };
    let record = state
        .engine
        .decide(&request.service_id, &principal.attributes, &request.resource);
    Json(record).into_response()
}

// ============================================================================
// Attributes
// ============================================================================

async fn attribute_query(State(state): State<AppState>, body: Bytes) -> Response {
    match state.attributes.process_query(&body).await {
        Ok(document) => (StatusCode::OK, document).into_response(),
        Err(e) => {
            error!(error = %e, "Attribute response could not be produced");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

// ============================================================================
// Services
// ============================================================================

async fn service_starting(
    State(state): State<AppState>,
    Path((service_id, index)): Path<(String, u32)>,
) -> Response {
    match state.sync.notify_service_starting(&service_id, index).await {
        NotifyOutcome::Success => Json(json!({ "outcome": "success" })).into_response(),
        NotifyOutcome::Failure => {
            warn!(service_id, index, "Startup cache clear failed");
            (StatusCode::BAD_GATEWAY, Json(json!({ "outcome": "failure" }))).into_response()
        }
    }
}
