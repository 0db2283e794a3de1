//! Routing configuration describing how a hostname's addresses are exposed.

use crate::selector::{
    is_empty_selector,
    LabelMatcher as _,
    Labels,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AddressKind {
    #[serde(rename = "IPAddress")]
    IPAddress,
    #[serde(rename = "Hostname")]
    Hostname,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategy {
    Simple,
    LoadBalanced,
    /// Any strategy this operator does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CustomWeight {
    pub weight: i64,
    pub selector: LabelSelector,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("must provide addresses")]
    MissingAddresses,
    #[error("cluster ID is required")]
    MissingClusterId,
    #[error("default weight is required")]
    MissingDefaultWeight,
    #[error("default geocode is required")]
    MissingDefaultGeoCode,
    #[error("custom weight cannot be zero")]
    ZeroCustomWeight,
    #[error("custom weight must define non-empty selector")]
    EmptyCustomWeightSelector,
}

/// Load balancing parameters shared by all writers of a hostname.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancing {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub default_geo_code: String,
    pub default_weight: i64,
    #[serde(default)]
    pub custom_weights: Vec<CustomWeight>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default)]
    pub addresses: Option<BTreeMap<String, AddressKind>>,
    #[serde(default)]
    pub strategy: Option<RoutingStrategy>,
    #[serde(default)]
    pub default_geo_code: String,
    #[serde(default)]
    pub default_weight: i64,
    #[serde(default)]
    pub custom_weights: Vec<CustomWeight>,
    #[serde(rename = "clusterID", default)]
    pub cluster_id: String,
}

impl Routing {
    /// Routing that publishes the addresses directly at the hostname.
    pub fn simple(addresses: BTreeMap<String, AddressKind>) -> Self {
        Self {
            addresses: Some(addresses),
            strategy: Some(RoutingStrategy::Simple),
            ..Default::default()
        }
    }

    /// Geo/weighted routing. Fails if the load balancing parameters are incomplete.
    pub fn load_balanced(
        addresses: BTreeMap<String, AddressKind>,
        load_balancing: LoadBalancing,
    ) -> Result<Self, RoutingError> {
        let LoadBalancing {
            cluster_id,
            default_geo_code,
            default_weight,
            custom_weights,
        } = load_balancing;
        let routing = Self {
            addresses: Some(addresses),
            strategy: Some(RoutingStrategy::LoadBalanced),
            default_geo_code,
            default_weight,
            custom_weights,
            cluster_id,
        };
        routing.validate()?;
        Ok(routing)
    }

    pub fn validate(&self) -> Result<(), RoutingError> {
        // simple routing has nothing else to check
        if self.strategy == Some(RoutingStrategy::Simple) {
            return Ok(());
        }

        if self.strategy.is_none() || self.addresses.is_none() {
            return Err(RoutingError::MissingAddresses);
        }
        if self.cluster_id.is_empty() {
            return Err(RoutingError::MissingClusterId);
        }
        if self.default_weight == 0 {
            return Err(RoutingError::MissingDefaultWeight);
        }
        if self.default_geo_code.is_empty() {
            return Err(RoutingError::MissingDefaultGeoCode);
        }

        for custom_weight in &self.custom_weights {
            if custom_weight.weight == 0 {
                return Err(RoutingError::ZeroCustomWeight);
            }
            if is_empty_selector(&custom_weight.selector) {
                return Err(RoutingError::EmptyCustomWeightSelector);
            }
        }
        Ok(())
    }

    /// Weight of the first custom weight whose selector matches `labels`, else the default weight.
    pub fn weight_for(&self, labels: &Labels) -> i64 {
        for custom_weight in &self.custom_weights {
            match custom_weight.selector.matches(labels) {
                Ok(true) => return custom_weight.weight,
                Ok(false) => {}
                Err(err) => {
                    warn!("ignoring custom weights after invalid selector: {err}");
                    return self.default_weight;
                }
            }
        }
        self.default_weight
    }

    /// Addresses split into IP targets and hostname targets, each in address order.
    pub fn partition_targets(&self) -> (Vec<String>, Vec<String>) {
        let mut ips = Vec::new();
        let mut hostnames = Vec::new();
        for (address, kind) in self.addresses.iter().flatten() {
            match kind {
                AddressKind::IPAddress => ips.push(address.clone()),
                AddressKind::Hostname => hostnames.push(address.clone()),
            }
        }
        (ips, hostnames)
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod routing_tests;
