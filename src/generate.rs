//! Endpoint generation.
//!
//! Turns a hostname plus a [`Routing`] configuration into the record set one writer contributes.
//! With simple routing the addresses are published directly at the hostname. With load-balanced
//! routing a four tier CNAME tree is produced:
//!
//! ```text
//! app.example.com                     CNAME  klb.app.example.com
//! klb.app.example.com                 CNAME  ie.klb.app.example.com          (geo IE, set id IE)
//! klb.app.example.com                 CNAME  ie.klb.app.example.com          (geo *, set id default)
//! ie.klb.app.example.com              CNAME  2q5hyv-a8xcra.klb.app.example.com (weight 120)
//! 2q5hyv-a8xcra.klb.app.example.com   A      127.0.0.1 127.0.0.2
//! ```
//!
//! Every writer of the same hostname generates the same top tiers, so the records they share are
//! identical and can be co-owned in the zone. The cluster specific name at the bottom is unique per
//! cluster and resource.

use crate::{
    endpoint::{
        sort_endpoints,
        Endpoint,
        DEFAULT_CNAME_TTL,
        DEFAULT_TTL,
        PROVIDER_SPECIFIC_GEO_CODE,
        PROVIDER_SPECIFIC_WEIGHT,
    },
    hash::short_code,
    resources::RecordType,
    routing::{
        Routing,
        RoutingError,
        RoutingStrategy,
    },
    selector::Labels,
};
use thiserror::Error;

/// Object label carrying the geo code of a writer.
pub const LABEL_GEO_CODE: &str = "dns.multicluster.io/lb-attribute-geo-code";
/// Geo code used when the object carries no geo label.
pub const DEFAULT_GEO: &str = "default";
/// Provider geo code matching any location.
pub const WILDCARD_GEO: &str = "*";

const LB_PREFIX: &str = "klb";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("listener hostname is empty")]
    EmptyHostname,
    #[error("object labels required")]
    MissingObjectLabels,
    #[error("unknown routing strategy")]
    UnknownRoutingStrategy,
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Name and namespace of the object the endpoints are generated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl NamespacedName {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Generates the endpoints for `hostname`, sorted by name and set identifier.
///
/// `labels` are the labels of the owning object. They are required for load-balanced routing,
/// where they select the geo code and the weight.
pub fn generate_endpoints(
    key: &NamespacedName,
    labels: Option<&Labels>,
    hostname: &str,
    routing: &Routing,
) -> Result<Vec<Endpoint>, GenerateError> {
    if hostname.is_empty() {
        return Err(GenerateError::EmptyHostname);
    }
    routing.validate()?;

    let mut endpoints = match routing.strategy {
        Some(RoutingStrategy::Simple) => simple_endpoints(hostname, routing),
        Some(RoutingStrategy::LoadBalanced) => {
            let labels = labels.ok_or(GenerateError::MissingObjectLabels)?;
            load_balanced_endpoints(key, labels, hostname, routing)
        }
        Some(RoutingStrategy::Unknown) | None => return Err(GenerateError::UnknownRoutingStrategy),
    };

    sort_endpoints(&mut endpoints);
    Ok(endpoints)
}

fn simple_endpoints(hostname: &str, routing: &Routing) -> Vec<Endpoint> {
    let (ips, hostnames) = routing.partition_targets();
    let mut endpoints = Vec::new();

    if !ips.is_empty() {
        endpoints.push(Endpoint::new(hostname, ips, RecordType::A, "", DEFAULT_TTL));
    }
    if !hostnames.is_empty() {
        endpoints.push(Endpoint::new(hostname, hostnames, RecordType::CNAME, "", DEFAULT_TTL));
    }
    endpoints
}

fn load_balanced_endpoints(key: &NamespacedName, labels: &Labels, hostname: &str, routing: &Routing) -> Vec<Endpoint> {
    let cname_host = hostname.strip_prefix("*.").unwrap_or(hostname);
    let lb_name = format!("{LB_PREFIX}.{cname_host}").to_lowercase();
    let geo_code = labels.get(LABEL_GEO_CODE).map_or(DEFAULT_GEO, String::as_str);
    let geo_lb_name = format!("{geo_code}.{lb_name}").to_lowercase();

    let (ips, mut hostnames) = routing.partition_targets();
    let mut endpoints = Vec::new();

    if !ips.is_empty() {
        let resource_code = short_code(&format!("{}-{}", key.name, key.namespace));
        let cluster_lb_name = format!("{}-{resource_code}.{lb_name}", short_code(&routing.cluster_id)).to_lowercase();
        endpoints.push(Endpoint::new(&cluster_lb_name, ips, RecordType::A, "", DEFAULT_TTL));
        hostnames.push(cluster_lb_name);
    }

    let weight = routing.weight_for(labels).to_string();
    for target in hostnames {
        endpoints.push(
            Endpoint::new(&geo_lb_name, vec![target.clone()], RecordType::CNAME, target, DEFAULT_TTL)
                .with_property(PROVIDER_SPECIFIC_WEIGHT, &weight),
        );
    }

    if endpoints.is_empty() {
        return endpoints;
    }

    let mut geo_tier = Endpoint::new(&lb_name, vec![geo_lb_name.clone()], RecordType::CNAME, geo_code, DEFAULT_CNAME_TTL);
    if geo_code != DEFAULT_GEO {
        geo_tier = geo_tier.with_property(PROVIDER_SPECIFIC_GEO_CODE, geo_code);
    }
    endpoints.push(geo_tier);

    if geo_code == routing.default_geo_code {
        endpoints.push(
            Endpoint::new(&lb_name, vec![geo_lb_name], RecordType::CNAME, DEFAULT_GEO, DEFAULT_CNAME_TTL)
                .with_property(PROVIDER_SPECIFIC_GEO_CODE, WILDCARD_GEO),
        );
    }

    endpoints.push(Endpoint::new(hostname, vec![lb_name], RecordType::CNAME, "", DEFAULT_CNAME_TTL));
    endpoints
}

#[cfg(test)]
#[path = "generate_tests.rs"]
mod generate_tests;
