use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use idp_common::{OutboundTransport, ProtocolMessage, SignedMessageCodec, TransportError, VerifyWith};
use tracing::debug;

use crate::error::{DeliveryError, Result};

/// One delivery attempt of an already-signed payload
#[async_trait]
pub trait DeliverySender: Send + Sync {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<()>;
}

/// What a verified reply must look like to count as delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    AnyVerifiedResponse,
    SuccessStatus,
}

/// Sends through an [`OutboundTransport`] and verifies the signed reply
pub struct SignedExchangeSender {
    transport: Arc<dyn OutboundTransport>,
    codec: Arc<dyn SignedMessageCodec>,
    acceptance: Acceptance,
    timeout: Duration,
}

impl SignedExchangeSender {
    pub fn new(
        transport: Arc<dyn OutboundTransport>,
        codec: Arc<dyn SignedMessageCodec>,
        acceptance: Acceptance,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            codec,
            acceptance,
            timeout,
        }
    }

    /// Send and return the verified reply, whatever its status
    pub async fn exchange(&self, endpoint: &str, payload: &[u8]) -> Result<ProtocolMessage> {
        let response = tokio::time::timeout(self.timeout, self.transport.send(endpoint, payload))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.to_string(),
            })??;

        let message = self.codec.deserialize(&response, &VerifyWith::Resolver)?;
        debug!(endpoint, kind = message.kind(), id = %message.header().id, "Verified response");
        Ok(message)
    }

    fn accept(&self, message: &ProtocolMessage) -> Result<()> {
        match self.acceptance {
            Acceptance::AnyVerifiedResponse => Ok(()),
            Acceptance::SuccessStatus => match message.status() {
                Some(status) if status.is_success() => Ok(()),
                Some(status) => Err(DeliveryError::Rejected(format!(
                    "status {:?}/{:?}: {}",
                    status.code,
                    status.sub_code,
                    status.message.as_deref().unwrap_or("")
                ))),
                None => Err(DeliveryError::Rejected(format!(
                    "expected a status response, got {}",
                    message.kind()
                ))),
            },
        }
    }
}

#[async_trait]
impl DeliverySender for SignedExchangeSender {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<()> {
        let message = self.exchange(endpoint, payload).await?;
        self.accept(&message)
    }
}
