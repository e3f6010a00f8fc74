use std::collections::BTreeMap;

use idp_common::{EndpointRef, MetadataError, MetadataResolver};
use idp_config::ServiceMetadataConfig;
use indexmap::IndexMap;

/// Relying service metadata loaded once from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    services: IndexMap<String, ServiceMetadataConfig>,
}

impl StaticMetadata {
    pub fn new(services: impl IntoIterator<Item = ServiceMetadataConfig>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|service| (service.service_id.clone(), service))
                .collect(),
        }
    }

    pub fn service_ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    fn service(&self, service_id: &str) -> Result<&ServiceMetadataConfig, MetadataError> {
        self.services
            .get(service_id)
            .ok_or_else(|| MetadataError::UnknownService(service_id.to_string()))
    }
}

impl MetadataResolver for StaticMetadata {
    fn is_known_service(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }

    fn resolve_response_endpoint(&self, service_id: &str, endpoint: &EndpointRef) -> Result<String, MetadataError> {
        let service = self.service(service_id)?;
        let found = match endpoint {
            EndpointRef::Index(index) => service
                .assertion_consumer_services
                .iter()
                .find(|acs| acs.index == *index),
            // a consumer URL is only honoured when it is registered
            EndpointRef::Url(url) => service
                .assertion_consumer_services
                .iter()
                .find(|acs| acs.location == *url),
        };
        found
            .map(|acs| acs.location.clone())
            .ok_or_else(|| MetadataError::unknown_endpoint(service_id, endpoint.to_string()))
    }

    fn resolve_logout_endpoints(&self, service_id: &str) -> Result<Vec<String>, MetadataError> {
        Ok(self.service(service_id)?.single_logout_services.clone())
    }

    fn resolve_acceptable_identifier_formats(&self, service_id: &str) -> Result<Vec<String>, MetadataError> {
        Ok(self.service(service_id)?.identifier_formats.clone())
    }

    fn resolve_cache_clear_endpoints(&self, service_id: &str) -> Result<BTreeMap<u32, String>, MetadataError> {
        Ok(self
            .service(service_id)?
            .cache_clear_services
            .iter()
            .map(|endpoint| (endpoint.index, endpoint.location.clone()))
            .collect())
    }
}
