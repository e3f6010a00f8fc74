use std::sync::Arc;

use chrono::Utc;
use idp_common::{IdentifierGenerator, SignedMessageCodec, SigningIdentity, VerifyWith};

use crate::error::{DeliveryError, Result};

/// Rebuilds a stored payload so it is valid to send again
pub trait PayloadRegenerator: Send + Sync {
    fn regenerate(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Re-signs a message this provider produced, with a new id and issue instant.
///
/// The stored payload must verify against our own signing key.
pub struct SignedMessageRegenerator {
    codec: Arc<dyn SignedMessageCodec>,
    identity: SigningIdentity,
    identifiers: Arc<dyn IdentifierGenerator>,
}

impl SignedMessageRegenerator {
    pub fn new(
        codec: Arc<dyn SignedMessageCodec>,
        identity: SigningIdentity,
        identifiers: Arc<dyn IdentifierGenerator>,
    ) -> Self {
        Self {
            codec,
            identity,
            identifiers,
        }
    }
}

impl PayloadRegenerator for SignedMessageRegenerator {
    fn regenerate(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut message = self
            .codec
            .deserialize(payload, &VerifyWith::Key(self.identity.key_name.clone()))
            .map_err(DeliveryError::Regeneration)?;

        message.refresh(self.identifiers.generate_message_id(), Utc::now());

        self.codec
            .serialize(&message, &self.identity)
            .map_err(DeliveryError::Regeneration)
    }
}
