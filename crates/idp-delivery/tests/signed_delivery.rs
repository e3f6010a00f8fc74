//! Regeneration and signed exchange against an in-process relying service

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use idp_codec::{HmacJsonCodec, StaticKeyResolver};
use idp_common::protocol::{ClearCacheRequest, MessageHeader, Status, StatusCode, StatusResponse, SubStatusCode};
use idp_common::{
    OutboundTransport, ProtocolMessage, RandomIdentifierGenerator, SignedMessageCodec,
    SigningIdentity, TransportError, VerifyWith,
};
use idp_delivery::{
    Acceptance, DeliveryError, DeliverySender, PayloadRegenerator, RetryPolicy, RetryingDelivery,
    SignedExchangeSender, SignedMessageRegenerator,
};

fn codec() -> Arc<HmacJsonCodec> {
    let keys = StaticKeyResolver::new()
        .with_key("idp", b"idp-secret".to_vec())
        .with_key("spep:1", b"spep-secret".to_vec());
    Arc::new(HmacJsonCodec::new(Arc::new(keys)))
}

fn clear_cache_request(codec: &HmacJsonCodec) -> Vec<u8> {
    let message = ProtocolMessage::ClearCacheRequest(ClearCacheRequest {
        header: MessageHeader::new("_original", "https://idp.example.edu", Utc::now()),
        reason: "Policy change".to_string(),
        group_targets: vec![],
    });
    codec.serialize(&message, &SigningIdentity::new("idp")).unwrap()
}

/// Relying service that answers with a signed status
struct MockService {
    codec: Arc<HmacJsonCodec>,
    status: Status,
    received: Mutex<Vec<ProtocolMessage>>,
    delay: Option<Duration>,
}

impl MockService {
    fn new(codec: Arc<HmacJsonCodec>, status: Status) -> Arc<Self> {
        Arc::new(Self {
            codec,
            status,
            received: Mutex::new(Vec::new()),
            delay: None,
        })
    }
}

#[async_trait]
impl OutboundTransport for MockService {
    async fn send(&self, _endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let request = self
            .codec
            .deserialize(payload, &VerifyWith::Key("idp".to_string()))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let in_response_to = request.header().id.clone();
        self.received.lock().push(request);

        let reply = ProtocolMessage::ClearCacheResponse(StatusResponse {
            header: MessageHeader::new("_reply", "spep:1", Utc::now()),
            in_response_to: Some(in_response_to),
            status: self.status.clone(),
        });
        self.codec
            .serialize(&reply, &SigningIdentity::new("spep:1"))
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

#[test]
fn test_regeneration_issues_fresh_id_and_signature() {
    let codec = codec();
    let regenerator = SignedMessageRegenerator::new(
        codec.clone(),
        SigningIdentity::new("idp"),
        Arc::new(RandomIdentifierGenerator),
    );
    let original = clear_cache_request(&codec);

    let regenerated = regenerator.regenerate(&original).unwrap();
    assert_ne!(regenerated, original);

    let message = codec
        .deserialize(&regenerated, &VerifyWith::Key("idp".to_string()))
        .unwrap();
    assert_ne!(message.header().id, "_original");
    assert_eq!(message.header().issuer, "https://idp.example.edu");
}

#[test]
fn test_regeneration_rejects_foreign_payload() {
    let codec = codec();
    let regenerator = SignedMessageRegenerator::new(
        codec.clone(),
        SigningIdentity::new("idp"),
        Arc::new(RandomIdentifierGenerator),
    );

    let err = regenerator.regenerate(b"not a message").unwrap_err();
    assert!(matches!(err, DeliveryError::Regeneration(_)));
}

#[tokio::test]
async fn test_success_status_is_accepted() {
    let codec = codec();
    let service = MockService::new(codec.clone(), Status::success());
    let sender = SignedExchangeSender::new(
        service.clone(),
        codec.clone(),
        Acceptance::SuccessStatus,
        Duration::from_secs(1),
    );

    sender.send("https://spep1/clear", &clear_cache_request(&codec)).await.unwrap();
    assert_eq!(service.received.lock().len(), 1);
}

#[tokio::test]
async fn test_failure_status_rejected_unless_any_response_accepted() {
    let codec = codec();
    let denied = Status::failure(StatusCode::Responder, SubStatusCode::RequestDenied, "busy");
    let service = MockService::new(codec.clone(), denied);

    let strict = SignedExchangeSender::new(
        service.clone(),
        codec.clone(),
        Acceptance::SuccessStatus,
        Duration::from_secs(1),
    );
    let err = strict.send("https://spep1/clear", &clear_cache_request(&codec)).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected(_)));

    let lenient = SignedExchangeSender::new(
        service,
        codec.clone(),
        Acceptance::AnyVerifiedResponse,
        Duration::from_secs(1),
    );
    lenient.send("https://spep1/clear", &clear_cache_request(&codec)).await.unwrap();
}

#[tokio::test]
async fn test_slow_service_hits_per_call_timeout() {
    let codec = codec();
    let service = Arc::new(MockService {
        codec: codec.clone(),
        status: Status::success(),
        received: Mutex::new(Vec::new()),
        delay: Some(Duration::from_millis(500)),
    });
    let sender = SignedExchangeSender::new(
        service,
        codec.clone(),
        Acceptance::SuccessStatus,
        Duration::from_millis(50),
    );

    let err = sender.send("https://spep1/clear", &clear_cache_request(&codec)).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Transport(TransportError::Timeout { .. })));
}

#[tokio::test]
async fn test_retry_cycle_resends_regenerated_payload() {
    let codec = codec();
    let service = MockService::new(codec.clone(), Status::success());
    let delivery = RetryingDelivery::new(
        "cache-clear",
        RetryPolicy::default(),
        Arc::new(SignedMessageRegenerator::new(
            codec.clone(),
            SigningIdentity::new("idp"),
            Arc::new(RandomIdentifierGenerator),
        )),
        Arc::new(SignedExchangeSender::new(
            service.clone(),
            codec.clone(),
            Acceptance::SuccessStatus,
            Duration::from_secs(1),
        )),
    )
    .unwrap();

    delivery.record("https://spep1/clear", clear_cache_request(&codec));
    let report = delivery.process_failures(Utc::now()).await;

    assert_eq!(report.delivered, 1);
    let received = service.received.lock();
    assert_eq!(received.len(), 1);
    assert_ne!(received[0].header().id, "_original");
}
