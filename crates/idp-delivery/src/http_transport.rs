//! HTTP transport for signed messages
//!
//! POSTs the payload to the endpoint and returns the body of a 2xx reply.

use std::time::Duration;

use async_trait::async_trait;
use idp_common::{OutboundTransport, TransportError};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub connect_timeout: Duration,
    /// Whole-request bound, including reading the reply
    pub request_timeout: Duration,
    pub content_type: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            content_type: "application/json".to_string(),
        }
    }
}

pub struct HttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn map_error(endpoint: &str, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else if e.is_connect() {
            TransportError::Connect {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl OutboundTransport for HttpTransport {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        debug!(endpoint, bytes = payload.len(), "Sending message");

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, self.config.content_type.as_str())
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| Self::map_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint, status = status.as_u16(), "Endpoint rejected message");
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(endpoint, e))?;
        Ok(body.to_vec())
    }
}
