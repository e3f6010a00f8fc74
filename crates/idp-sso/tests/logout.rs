//! Logout fan-out against mock relying services

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use idp_common::{ProtocolMessage, RandomIdentifierGenerator, SigningIdentity};
use idp_delivery::{
    Acceptance, RetryPolicy, RetryingDelivery, SignedExchangeSender, SignedMessageRegenerator,
};
use idp_sso::{LogoutError, LogoutService};
use support::*;

struct Harness {
    sessions: Arc<MockSessions>,
    services: Arc<MockServices>,
    retry: Arc<RetryingDelivery>,
    logout: LogoutService,
}

fn harness(metadata: MockMetadata) -> Harness {
    let codec = codec();
    let services = MockServices::new(codec.clone());

    let mut p = principal("s1", Utc::now());
    p.add_service_session_index("spep:1", "_i1");
    p.add_service_session_index("spep:1", "_i2");
    p.add_service_session_index("spep:2", "_j1");
    let sessions = MockSessions::with(vec![p]);

    let retry = Arc::new(
        RetryingDelivery::new(
            "logout",
            RetryPolicy::default(),
            Arc::new(SignedMessageRegenerator::new(
                codec.clone(),
                SigningIdentity::new("idp"),
                Arc::new(RandomIdentifierGenerator),
            )),
            Arc::new(SignedExchangeSender::new(
                services.clone(),
                codec.clone(),
                Acceptance::AnyVerifiedResponse,
                Duration::from_secs(2),
            )),
        )
        .unwrap(),
    );

    let logout = LogoutService::new(
        sessions.clone(),
        Arc::new(metadata),
        codec,
        SigningIdentity::new("idp"),
        ISSUER,
        Arc::new(RandomIdentifierGenerator),
        retry.clone(),
    );

    Harness {
        sessions,
        services,
        retry,
        logout,
    }
}

fn two_services() -> MockMetadata {
    let metadata = MockMetadata::with_logout("spep:1", &["https://one/a", "https://one/b"]);
    metadata.add_logout("spep:2", &["https://two/a"]);
    metadata
}

#[tokio::test]
async fn test_every_endpoint_is_notified() {
    let h = harness(two_services());

    let states = h.logout.logout("s1").await.unwrap();

    let services: Vec<&String> = states.keys().collect();
    assert_eq!(services, vec!["spep:1", "spep:2"]);
    assert_eq!(states["spep:1"].len(), 2);
    assert!(states.values().flatten().all(|s| s.succeeded));

    let received = h.services.received.lock();
    assert_eq!(received.len(), 3);
    match &received[0].1 {
        ProtocolMessage::LogoutRequest(request) => {
            assert_eq!(request.name_id, "_fed");
            assert_eq!(request.session_indices, vec!["_i1".to_string(), "_i2".to_string()]);
        }
        other => panic!("unexpected {}", other.kind()),
    }
    match &received[2].1 {
        ProtocolMessage::LogoutRequest(request) => {
            assert_eq!(request.session_indices, vec!["_j1".to_string()]);
        }
        other => panic!("unexpected {}", other.kind()),
    }

    assert!(h.sessions.get("s1").is_none());
    assert_eq!(h.retry.pending(), 0);
}

#[tokio::test]
async fn test_total_failure_still_terminates_session() {
    let h = harness(two_services());
    for endpoint in ["https://one/a", "https://one/b", "https://two/a"] {
        h.services.take_down(endpoint);
    }

    let states = h.logout.logout("s1").await.unwrap();

    assert!(states.values().flatten().all(|s| !s.succeeded));
    assert_eq!(h.retry.pending(), 3);
    assert_eq!(*h.sessions.terminated.lock(), vec!["s1".to_string()]);
}

#[tokio::test]
async fn test_partial_failure_is_retried_later() {
    let h = harness(two_services());
    h.services.take_down("https://one/b");

    let states = h.logout.logout("s1").await.unwrap();
    let failed: Vec<&str> = states
        .values()
        .flatten()
        .filter(|s| !s.succeeded)
        .map(|s| s.endpoint.as_str())
        .collect();
    assert_eq!(failed, vec!["https://one/b"]);
    assert_eq!(h.retry.pending(), 1);

    h.services.bring_up("https://one/b");
    let report = h.retry.process_failures(Utc::now()).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.retry.pending(), 0);
}

#[tokio::test]
async fn test_service_without_endpoints_is_reported_failed() {
    let h = harness(MockMetadata::with_logout("spep:1", &["https://one/a"]));

    let states = h.logout.logout("s1").await.unwrap();

    assert!(states["spep:1"][0].succeeded);
    let spep2 = &states["spep:2"];
    assert_eq!(spep2.len(), 1);
    assert!(!spep2[0].succeeded);
    assert_eq!(h.retry.pending(), 0);
    assert!(h.sessions.get("s1").is_none());
}

#[tokio::test]
async fn test_unknown_session_sends_nothing() {
    let h = harness(two_services());

    let err = h.logout.logout("nope").await.unwrap_err();

    assert!(matches!(err, LogoutError::InvalidSession(_)));
    assert!(h.services.received.lock().is_empty());
    assert!(h.sessions.terminated.lock().is_empty());
}
