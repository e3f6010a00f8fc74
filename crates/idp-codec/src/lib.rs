//! Signed message codec
//!
//! Messages are serialized to JSON and wrapped in an envelope carrying the
//! signing key name and an HMAC-SHA256 signature over the body bytes:
//!
//! ```json
//! { "keyName": "idp", "signature": "<hex>", "body": "<base64 json>" }
//! ```
//!
//! Verification either pins a single key or resolves the key named in the
//! envelope through a [`KeyResolver`].

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use idp_common::{CodecError, ProtocolMessage, SignedMessageCodec, SigningIdentity, VerifyWith};

type HmacSha256 = Hmac<Sha256>;

/// Trusted key lookup by key name
pub trait KeyResolver: Send + Sync {
    fn resolve_key(&self, key_name: &str) -> Option<Vec<u8>>;
}

/// Fixed set of keys, typically built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, Vec<u8>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_name: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(key_name.into(), secret.into());
        self
    }

    /// Build from key name to hex secret pairs
    pub fn from_hex<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, CodecError> {
        let mut keys = HashMap::new();
        for (name, secret) in entries {
            let bytes = hex::decode(secret).map_err(|e| {
                CodecError::ReferenceInvalid(format!("key '{}' is not valid hex: {}", name, e))
            })?;
            keys.insert(name.clone(), bytes);
        }
        Ok(Self { keys })
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve_key(&self, key_name: &str) -> Option<Vec<u8>> {
        self.keys.get(key_name).cloned()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    key_name: String,
    signature: String,
    body: String,
}

pub struct HmacJsonCodec {
    keys: Arc<dyn KeyResolver>,
}

impl HmacJsonCodec {
    pub fn new(keys: Arc<dyn KeyResolver>) -> Self {
        Self { keys }
    }

    fn mac(key: &[u8]) -> Result<HmacSha256, CodecError> {
        <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| CodecError::Serialization(format!("unusable signing key: {}", e)))
    }
}

impl SignedMessageCodec for HmacJsonCodec {
    fn serialize(
        &self,
        message: &ProtocolMessage,
        identity: &SigningIdentity,
    ) -> Result<Vec<u8>, CodecError> {
        let key = self.keys.resolve_key(&identity.key_name).ok_or_else(|| {
            CodecError::Serialization(format!("no signing key named '{}'", identity.key_name))
        })?;

        let body = serde_json::to_vec(message)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;

        let mut mac = Self::mac(&key)?;
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let envelope = Envelope {
            key_name: identity.key_name.clone(),
            signature,
            body: BASE64.encode(&body),
        };
        serde_json::to_vec(&envelope).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8], verify: &VerifyWith) -> Result<ProtocolMessage, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::Parse(format!("malformed envelope: {}", e)))?;

        if let VerifyWith::Key(expected) = verify {
            if &envelope.key_name != expected {
                return Err(CodecError::ReferenceInvalid(format!(
                    "message signed with '{}', expected '{}'",
                    envelope.key_name, expected
                )));
            }
        }

        let key = self.keys.resolve_key(&envelope.key_name).ok_or_else(|| {
            CodecError::ReferenceInvalid(format!("untrusted key '{}'", envelope.key_name))
        })?;

        let body = BASE64
            .decode(envelope.body.as_bytes())
            .map_err(|e| CodecError::Parse(format!("body is not base64: {}", e)))?;

        let presented = hex::decode(&envelope.signature)
            .map_err(|_| CodecError::SignatureInvalid("signature is not hex".to_string()))?;

        let mut mac = Self::mac(&key)?;
        mac.update(&body);
        let computed = mac.finalize().into_bytes();
        if !constant_time_eq(&presented, &computed) {
            debug!(key_name = %envelope.key_name, "Signature mismatch");
            return Err(CodecError::SignatureInvalid(format!(
                "signature does not verify with key '{}'",
                envelope.key_name
            )));
        }

        serde_json::from_slice(&body).map_err(|e| CodecError::Parse(e.to_string()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}
