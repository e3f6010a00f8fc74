//! Identity provider configuration
//!
//! Loaded from TOML with every section defaulted, then overridden from
//! `IDP_*` environment variables and validated. Validation failures are
//! configuration errors and must stop startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use idp_common::Decision;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Entity id placed in the issuer of every message this provider signs
    pub issuer: String,
    pub signing_key_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            issuer: "https://idp.localhost".to_string(),
            signing_key_name: "idp-signing".to_string(),
        }
    }
}

/// Upper bound on assertion validity skew (one day)
pub const MAX_ALLOWED_TIME_SKEW_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsoConfig {
    pub allowed_time_skew_secs: u64,
    /// Identifier format URI to the attribute that supplies its value
    pub identifier_format_attributes: IndexMap<String, String>,
    /// Issuer substring that triggers email local-part identifiers
    pub vendor_override_marker: String,
    pub vendor_override_attribute: String,
}

impl Default for SsoConfig {
    fn default() -> Self {
        let mut identifier_format_attributes = IndexMap::new();
        identifier_format_attributes.insert(
            idp_common::protocol::EMAIL_FORMAT.to_string(),
            "mail".to_string(),
        );
        Self {
            allowed_time_skew_secs: 300,
            identifier_format_attributes,
            vendor_override_marker: "google".to_string(),
            vendor_override_attribute: "mail".to_string(),
        }
    }
}

impl SsoConfig {
    pub fn allowed_time_skew(&self) -> Duration {
        Duration::from_secs(self.allowed_time_skew_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub default_decision: Decision,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            default_decision: Decision::Deny,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySyncConfig {
    pub poll_interval_secs: u64,
}

impl Default for PolicySyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

impl PolicySyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retry_interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 60,
            max_age_secs: 3600,
        }
    }
}

impl RetryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEndpoint {
    pub index: u32,
    pub location: String,
}

/// Static metadata for one relying service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMetadataConfig {
    pub service_id: String,
    pub assertion_consumer_services: Vec<IndexedEndpoint>,
    pub single_logout_services: Vec<String>,
    pub cache_clear_services: Vec<IndexedEndpoint>,
    pub identifier_formats: Vec<String>,
}

/// Policy document seeded into the in-memory policy store at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySeedConfig {
    pub service_id: String,
    pub path: PathBuf,
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    pub identity: IdentityConfig,
    /// Key name to hex-encoded shared secret
    pub keys: BTreeMap<String, String>,
    pub sso: SsoConfig,
    pub authorization: AuthorizationConfig,
    pub policy_sync: PolicySyncConfig,
    pub logout_retry: RetryConfig,
    pub cache_retry: RetryConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
    pub services: Vec<ServiceMetadataConfig>,
    pub policies: Vec<PolicySeedConfig>,
}

impl IdpConfig {
    /// Read, override from the environment, and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");

        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("IDP_ISSUER") {
            self.identity.issuer = v;
        }
        if let Some(v) = lookup("IDP_SIGNING_KEY_NAME") {
            self.identity.signing_key_name = v;
        }
        if let Some(v) = lookup("IDP_DEFAULT_DECISION") {
            match v.to_ascii_lowercase().as_str() {
                "permit" => self.authorization.default_decision = Decision::Permit,
                "deny" => self.authorization.default_decision = Decision::Deny,
                other => debug!(value = other, "Ignoring unrecognised IDP_DEFAULT_DECISION"),
            }
        }
        if let Some(v) = lookup("IDP_POLICY_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.policy_sync.poll_interval_secs = v;
        }
        if let Some(v) = lookup("IDP_ALLOWED_TIME_SKEW_SECS").and_then(|v| v.parse().ok()) {
            self.sso.allowed_time_skew_secs = v;
        }
        if let Some(v) = lookup("IDP_LOG_JSON").and_then(|v| v.parse().ok()) {
            self.logging.json = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.issuer.trim().is_empty() {
            return Err(ConfigError::invalid("identity.issuer must be set"));
        }
        if self.identity.signing_key_name.trim().is_empty() {
            return Err(ConfigError::invalid("identity.signing_key_name must be set"));
        }
        if !self.keys.contains_key(&self.identity.signing_key_name) {
            return Err(ConfigError::invalid(format!(
                "no key configured for signing key name '{}'",
                self.identity.signing_key_name
            )));
        }
        if self.sso.allowed_time_skew_secs == 0 {
            return Err(ConfigError::invalid("sso.allowed_time_skew_secs must be greater than zero"));
        }
        if self.sso.allowed_time_skew_secs > MAX_ALLOWED_TIME_SKEW_SECS {
            return Err(ConfigError::invalid(format!(
                "sso.allowed_time_skew_secs must not exceed {}",
                MAX_ALLOWED_TIME_SKEW_SECS
            )));
        }
        if self.policy_sync.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("policy_sync.poll_interval_secs must be greater than zero"));
        }
        for (name, retry) in [("logout_retry", &self.logout_retry), ("cache_retry", &self.cache_retry)] {
            if retry.retry_interval_secs == 0 {
                return Err(ConfigError::invalid(format!(
                    "{}.retry_interval_secs must be greater than zero",
                    name
                )));
            }
            if retry.max_age_secs == 0 {
                return Err(ConfigError::invalid(format!(
                    "{}.max_age_secs must be greater than zero",
                    name
                )));
            }
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("transport.request_timeout_ms must be greater than zero"));
        }
        for service in &self.services {
            if service.service_id.trim().is_empty() {
                return Err(ConfigError::invalid("services entries need a service_id"));
            }
        }
        for seed in &self.policies {
            if !self.services.iter().any(|s| s.service_id == seed.service_id) {
                return Err(ConfigError::invalid(format!(
                    "policy {} is seeded for unknown service '{}'",
                    seed.path.display(),
                    seed.service_id
                )));
            }
        }
        Ok(())
    }
}
