//! Turns a request for a hostname into a complete `DNSRecord` manifest.

use crate::{
    generate::{
        generate_endpoints,
        GenerateError,
        NamespacedName,
    },
    resources::{
        DNSRecord,
        DNSRecordSpec,
        HealthCheckSpec,
        ProviderRef,
    },
    routing::Routing,
    selector::Labels,
};
use serde::{
    Deserialize,
    Serialize,
};

/// A hostname to publish, with the labels of the object it belongs to and its routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRequest {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    pub hostname: String,
    /// Defaults to the hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_host: Option<String>,
    pub provider_ref: ProviderRef,
    #[serde(rename = "ownerID", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

impl EndpointRequest {
    pub fn build_dns_record(&self) -> Result<DNSRecord, GenerateError> {
        let key = NamespacedName::new(&self.name, &self.namespace);
        let endpoints = generate_endpoints(&key, Some(&self.labels), &self.hostname, &self.routing)?;

        let mut record = DNSRecord::new(
            &self.name,
            DNSRecordSpec {
                owner_id: self.owner_id.clone(),
                root_host: self.root_host.clone().unwrap_or_else(|| self.hostname.clone()),
                provider_ref: self.provider_ref.clone(),
                endpoints,
                health_check: self.health_check.clone(),
            },
        );
        record.metadata.namespace = Some(self.namespace.clone());
        if !self.labels.is_empty() {
            record.metadata.labels = Some(self.labels.clone());
        }
        Ok(record)
    }
}
