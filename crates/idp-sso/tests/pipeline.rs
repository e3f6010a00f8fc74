//! SSO pipeline state machine and session validation

mod support;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use idp_common::protocol::{StatusCode, SubStatusCode, EMAIL_FORMAT};
use idp_sso::{
    AuthnRequestHandler, Handler, PipelineContext, PipelineResult, RequestOutcome,
    SignedResponseHandler, SsoError, SsoPipeline, Stage, MAX_RESETS,
};
use support::*;

// ============================================================================
// Scripted handlers
// ============================================================================

/// Request handler that replays a script, then a fallback outcome.
/// On `Successful` it stores a parsed request so session validation can run.
struct Scripted {
    name: &'static str,
    calls: AtomicUsize,
    script: Mutex<VecDeque<RequestOutcome>>,
    fallback: RequestOutcome,
}

impl Scripted {
    fn new(name: &'static str, script: Vec<RequestOutcome>, fallback: RequestOutcome) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            fallback,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute_request(&self, ctx: &mut PipelineContext) -> RequestOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
        if outcome == RequestOutcome::Successful {
            ctx.authn_request = Some(authn_request("spep:1", true));
            ctx.response_endpoint = Some(ACS.to_string());
        }
        outcome
    }
}

fn scripted_pipeline(handlers: Vec<Arc<Scripted>>) -> SsoPipeline {
    let codec = codec();
    let request_handlers: Vec<Arc<dyn Handler>> = handlers
        .into_iter()
        .map(|h| h as Arc<dyn Handler>)
        .collect();
    SsoPipeline::new(
        request_handlers,
        validator(MockSessions::with(vec![]), codec.clone()),
        vec![Arc::new(SignedResponseHandler::new(responses(codec)))],
    )
    .unwrap()
}

// ============================================================================
// Full stack
// ============================================================================

struct Stack {
    codec: Arc<idp_codec::HmacJsonCodec>,
    sessions: Arc<MockSessions>,
    pipeline: SsoPipeline,
}

fn stack(principals: Vec<idp_common::Principal>) -> Stack {
    let codec = codec();
    let sessions = MockSessions::with(principals);
    let responses = responses(codec.clone());
    let pipeline = SsoPipeline::new(
        vec![Arc::new(AuthnRequestHandler::new(codec.clone(), Arc::new(MockMetadata::default())))],
        validator(sessions.clone(), codec.clone()),
        vec![Arc::new(SignedResponseHandler::new(responses))],
    )
    .unwrap();
    Stack {
        codec,
        sessions,
        pipeline,
    }
}

#[tokio::test]
async fn test_established_session_gets_signed_assertion() {
    let s = stack(vec![principal("s1", Utc::now())]);
    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("spep:1", true)))
        .with_session_id("s1");

    let result = s.pipeline.execute(&mut ctx).await;

    assert_eq!(result, PipelineResult::Successful);
    assert_eq!(ctx.current_stage, Stage::None);
    assert_eq!(ctx.current_handler, None);

    let response = decode_response(&s.codec, ctx.response_document.as_deref().unwrap());
    assert!(response.status.is_success());
    assert_eq!(response.destination.as_deref(), Some(ACS));
    let assertion = response.assertion.unwrap();
    assert_eq!(assertion.subject.name_id.format, EMAIL_FORMAT);
    assert_eq!(assertion.subject.name_id.value, "beddoes@example.edu");

    let index = ctx.session_index.clone().unwrap();
    assert_eq!(assertion.authn_statement.session_index, index);
    let stored = s.sessions.get("s1").unwrap();
    assert_eq!(stored.session_indices_for("spep:1"), &[index]);
    assert!(stored.is_active_for("spep:1"));
}

#[tokio::test]
async fn test_missing_session_suspends_and_resumes_after_login() {
    let s = stack(vec![principal("s1", Utc::now())]);
    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("spep:1", true)));

    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::NeedsFreshAuthentication);
    assert_eq!(ctx.current_stage, Stage::SsoProcessing);

    // the caller persists the context across the login redirect
    let stored = ctx.to_json().unwrap();
    let mut resumed = PipelineContext::from_json(&stored).unwrap();
    resumed.session_id = Some("s1".to_string());

    assert_eq!(s.pipeline.execute(&mut resumed).await, PipelineResult::Successful);
    assert!(resumed.response_document.is_some());
}

#[tokio::test]
async fn test_passive_request_without_session_is_denied() {
    let s = stack(vec![]);
    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("spep:1", false)));

    let result = s.pipeline.execute(&mut ctx).await;

    assert_eq!(result, PipelineResult::NeedsFreshAuthenticationPassiveDenied);
    assert_eq!(ctx.current_stage, Stage::None);
    let response = decode_response(&s.codec, ctx.response_document.as_deref().unwrap());
    assert_eq!(response.status.code, StatusCode::Requester);
    assert_eq!(response.status.sub_code, Some(SubStatusCode::RequestDenied));
    assert_eq!(response.in_response_to.as_deref(), Some("_request"));
}

#[tokio::test]
async fn test_unknown_or_expired_session() {
    let expired = principal("old", Utc::now() - Duration::hours(9));

    let s = stack(vec![expired.clone()]);
    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("spep:1", false)))
        .with_session_id("old");
    assert_eq!(
        s.pipeline.execute(&mut ctx).await,
        PipelineResult::NeedsFreshAuthenticationPassiveDenied
    );
    let response = decode_response(&s.codec, ctx.response_document.as_deref().unwrap());
    assert_eq!(response.status.code, StatusCode::Responder);
    assert_eq!(response.status.sub_code, Some(SubStatusCode::AuthnFailed));

    let s = stack(vec![expired]);
    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("spep:1", true)))
        .with_session_id("missing");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::NeedsFreshAuthentication);
}

#[tokio::test]
async fn test_forced_authentication() {
    let s = stack(vec![principal("s1", Utc::now() - Duration::hours(1))]);

    let mut request = authn_request("spep:1", true);
    request.force_authn = true;
    let mut ctx = PipelineContext::new(signed_request(&s.codec, request.clone())).with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::NeedsFreshAuthentication);

    request.is_passive = true;
    let mut ctx = PipelineContext::new(signed_request(&s.codec, request)).with_session_id("s1");
    assert_eq!(
        s.pipeline.execute(&mut ctx).await,
        PipelineResult::NeedsFreshAuthenticationPassiveDenied
    );
    let response = decode_response(&s.codec, ctx.response_document.as_deref().unwrap());
    assert_eq!(response.status.sub_code, Some(SubStatusCode::NoPassive));
}

#[tokio::test]
async fn test_recent_authentication_satisfies_forced_authentication() {
    let s = stack(vec![principal("s1", Utc::now())]);
    let mut request = authn_request("spep:1", false);
    request.force_authn = true;
    request.is_passive = true;

    let mut ctx = PipelineContext::new(signed_request(&s.codec, request)).with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Successful);
}

#[tokio::test]
async fn test_principal_without_federated_identifier_is_terminated() {
    let mut broken = principal("s1", Utc::now());
    broken.federated_identifier.clear();
    let s = stack(vec![broken]);

    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("spep:1", true)))
        .with_session_id("s1");

    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Failed);
    assert_eq!(*s.sessions.terminated.lock(), vec!["s1".to_string()]);
    let response = decode_response(&s.codec, ctx.response_document.as_deref().unwrap());
    assert_eq!(response.status.sub_code, Some(SubStatusCode::AuthnFailed));
}

#[tokio::test]
async fn test_request_problems_fail_the_transaction() {
    let s = stack(vec![principal("s1", Utc::now())]);

    let mut ctx = PipelineContext::new(b"not signed".to_vec()).with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Failed);
    assert_eq!(ctx.current_stage, Stage::None);

    let mut ctx = PipelineContext::new(signed_request(&s.codec, authn_request("rogue", true)))
        .with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Failed);

    let mut request = authn_request("spep:1", true);
    request.assertion_consumer_service_index = Some(9);
    let mut ctx = PipelineContext::new(signed_request(&s.codec, request)).with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Failed);

    let mut request = authn_request("spep:1", true);
    request.name_id_policy = None;
    let mut ctx = PipelineContext::new(signed_request(&s.codec, request)).with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Failed);
}

#[tokio::test]
async fn test_consumer_url_uses_request_format() {
    let s = stack(vec![principal("s1", Utc::now())]);
    let mut request = authn_request("spep:1", true);
    request.assertion_consumer_service_index = None;
    request.assertion_consumer_service_url = Some(ACS.to_string());
    request.name_id_policy.as_mut().unwrap().format = Some("urn:unmapped".to_string());

    let mut ctx = PipelineContext::new(signed_request(&s.codec, request)).with_session_id("s1");
    assert_eq!(s.pipeline.execute(&mut ctx).await, PipelineResult::Successful);
    assert_eq!(ctx.identifier_formats, vec!["urn:unmapped".to_string()]);

    let response = decode_response(&s.codec, ctx.response_document.as_deref().unwrap());
    let name_id = response.assertion.unwrap().subject.name_id;
    assert_eq!(name_id.value, "_fed");
}

// ============================================================================
// Handler iteration
// ============================================================================

#[tokio::test]
async fn test_resumed_context_skips_earlier_handlers() {
    let first = Scripted::new("first", vec![], RequestOutcome::NoAction);
    let second = Scripted::new("second", vec![], RequestOutcome::Successful);
    let pipeline = scripted_pipeline(vec![first.clone(), second.clone()]);

    let mut ctx = PipelineContext::default();
    ctx.current_stage = Stage::RequestProcessing;
    ctx.current_handler = Some("second".to_string());

    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(first.calls(), 0);
    assert_eq!(second.calls(), 1);
    // no session id was presented, so the transaction suspends for login
    assert_eq!(result, PipelineResult::NeedsFreshAuthentication);
}

#[tokio::test]
async fn test_no_action_falls_through_in_order() {
    let first = Scripted::new("first", vec![], RequestOutcome::NoAction);
    let second = Scripted::new("second", vec![], RequestOutcome::Successful);
    let third = Scripted::new("third", vec![], RequestOutcome::Successful);
    let pipeline = scripted_pipeline(vec![first.clone(), second.clone(), third.clone()]);

    let mut ctx = PipelineContext::default();
    pipeline.execute(&mut ctx).await;

    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
}

#[tokio::test]
async fn test_reset_restarts_from_the_first_handler() {
    let first = Scripted::new("first", vec![], RequestOutcome::NoAction);
    let second = Scripted::new("second", vec![RequestOutcome::Reset], RequestOutcome::Successful);
    let pipeline = scripted_pipeline(vec![first.clone(), second.clone()]);

    let mut ctx = PipelineContext::default();
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(result, PipelineResult::NeedsFreshAuthentication);
    assert_eq!(first.calls(), 2);
    assert_eq!(second.calls(), 2);
}

#[tokio::test]
async fn test_endless_reset_is_bounded() {
    let first = Scripted::new("first", vec![], RequestOutcome::NoAction);
    let looping = Scripted::new("looping", vec![], RequestOutcome::Reset);
    let pipeline = scripted_pipeline(vec![first.clone(), looping.clone()]);

    let mut ctx = PipelineContext::default();
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(result, PipelineResult::Failed);
    assert_eq!(looping.calls(), MAX_RESETS + 1);
    assert_eq!(ctx.current_stage, Stage::None);
}

#[tokio::test]
async fn test_no_accepting_handler_fails() {
    let only = Scripted::new("only", vec![], RequestOutcome::NoAction);
    let pipeline = scripted_pipeline(vec![only.clone()]);

    let mut ctx = PipelineContext::default();
    assert_eq!(pipeline.execute(&mut ctx).await, PipelineResult::Failed);
    assert_eq!(only.calls(), 1);
    assert!(!ctx.invalidated);
}

#[tokio::test]
async fn test_unregistered_marker_invalidates_context() {
    let first = Scripted::new("first", vec![], RequestOutcome::Successful);
    let pipeline = scripted_pipeline(vec![first.clone()]);

    let mut ctx = PipelineContext::new(b"request".to_vec()).with_session_id("s1");
    ctx.current_stage = Stage::RequestProcessing;
    ctx.current_handler = Some("removed-handler".to_string());

    assert_eq!(pipeline.execute(&mut ctx).await, PipelineResult::Failed);
    assert!(ctx.invalidated);
    assert_eq!(ctx.session_id, None);
    assert_eq!(first.calls(), 0);

    // an invalidated context is never executed again
    assert_eq!(pipeline.execute(&mut ctx).await, PipelineResult::Failed);
    assert_eq!(first.calls(), 0);

    let mut ctx = PipelineContext::default();
    ctx.current_stage = Stage::SsoProcessing;
    ctx.current_handler = Some("first".to_string());
    assert_eq!(pipeline.execute(&mut ctx).await, PipelineResult::Failed);
    assert!(ctx.invalidated);
}

#[test]
fn test_handler_registration_is_checked() {
    let codec = codec();
    let a = Scripted::new("a", vec![], RequestOutcome::NoAction);

    let err = SsoPipeline::new(
        vec![a.clone(), a.clone()],
        validator(MockSessions::with(vec![]), codec.clone()),
        vec![Arc::new(SignedResponseHandler::new(responses(codec.clone())))],
    )
    .err()
    .unwrap();
    assert!(matches!(err, SsoError::Configuration { .. }));

    let err = SsoPipeline::new(
        vec![a],
        validator(MockSessions::with(vec![]), codec),
        vec![],
    )
    .err()
    .unwrap();
    assert!(matches!(err, SsoError::Configuration { .. }));
}
