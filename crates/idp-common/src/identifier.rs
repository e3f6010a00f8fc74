use rand::RngCore;
use uuid::Uuid;

/// Source of protocol identifiers
pub trait IdentifierGenerator: Send + Sync {
    /// Id for a new protocol message
    fn generate_message_id(&self) -> String;

    /// Per-service session index
    fn generate_session_index(&self) -> String;

    fn generate_session_id(&self) -> String;

    fn generate_federated_identifier(&self) -> String;
}

/// Identifiers must start with a letter or underscore, so all of these are `_` prefixed
#[derive(Debug, Default, Clone)]
pub struct RandomIdentifierGenerator;

impl RandomIdentifierGenerator {
    fn random_hex(bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        hex::encode(buf)
    }
}

impl IdentifierGenerator for RandomIdentifierGenerator {
    fn generate_message_id(&self) -> String {
        format!("_{}-{}", Uuid::new_v4().simple(), Self::random_hex(8))
    }

    fn generate_session_index(&self) -> String {
        format!("_{}", Self::random_hex(20))
    }

    fn generate_session_id(&self) -> String {
        format!("_{}", Self::random_hex(32))
    }

    fn generate_federated_identifier(&self) -> String {
        format!("_{}", Uuid::new_v4().simple())
    }
}
