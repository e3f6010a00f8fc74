use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Principal / Session
// ============================================================================

/// A resolved attribute and the handlers that contributed values to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRecord {
    #[serde(rename = "type")]
    pub attribute_type: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub contributing_handlers: Vec<String>,
}

impl AttributeRecord {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            attribute_type: "string".to_string(),
            values,
            contributing_handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.contributing_handlers.push(handler.into());
        self
    }
}

/// Session state for an authenticated principal.
///
/// Active services are derived from `service_session_indices`, so a service
/// is active exactly when at least one index has been issued to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub session_id: String,
    pub federated_identifier: String,
    pub local_principal_identifier: String,
    pub authn_timestamp: DateTime<Utc>,
    pub session_expiry: DateTime<Utc>,
    pub authentication_context_class: String,
    #[serde(default)]
    pub attributes: IndexMap<String, AttributeRecord>,
    #[serde(default)]
    pub service_session_indices: IndexMap<String, Vec<String>>,
}

impl Principal {
    pub fn active_service_ids(&self) -> impl Iterator<Item = &str> {
        self.service_session_indices
            .iter()
            .filter(|(_, indices)| !indices.is_empty())
            .map(|(service_id, _)| service_id.as_str())
    }

    pub fn is_active_for(&self, service_id: &str) -> bool {
        self.service_session_indices
            .get(service_id)
            .map(|indices| !indices.is_empty())
            .unwrap_or(false)
    }

    pub fn session_indices_for(&self, service_id: &str) -> &[String] {
        self.service_session_indices
            .get(service_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_service_session_index(&mut self, service_id: &str, index: impl Into<String>) {
        self.service_session_indices
            .entry(service_id.to_string())
            .or_default()
            .push(index.into());
    }

    /// Expiry is checked lazily by readers
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.session_expiry
    }

    pub fn authn_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.authn_timestamp
    }

    /// First non-empty value of the named attribute
    pub fn first_attribute_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|record| record.values.first())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn with_attribute(mut self, name: impl Into<String>, values: Vec<&str>) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeRecord::new(values.into_iter().map(str::to_string).collect()),
        );
        self
    }
}

/// Input for creating a session once the principal has authenticated
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub local_principal_identifier: String,
    pub authentication_context_class: String,
    pub attributes: IndexMap<String, AttributeRecord>,
    pub lifetime: Duration,
}

// ============================================================================
// Policy Cache Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCacheEntry {
    pub service_id: String,
    pub policy_id: String,
    /// Raw policy document, parsed by the cache when loaded
    pub policy_document: String,
    pub sequence_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyAction {
    Add,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// A durable-store change record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChange {
    pub entry: PolicyCacheEntry,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Permit,
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Permit => write!(f, "Permit"),
            Decision::Deny => write!(f, "Deny"),
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// A signed message that could not be delivered and awaits a retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub endpoint: String,
    pub payload: Vec<u8>,
    pub first_failure: DateTime<Utc>,
}

impl FailedDelivery {
    pub fn new(endpoint: impl Into<String>, payload: Vec<u8>, first_failure: DateTime<Utc>) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload,
            first_failure,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.first_failure
    }
}
