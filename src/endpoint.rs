use crate::resources::RecordType;
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;

/// TTL of address records and weighted branches.
pub const DEFAULT_TTL: i64 = 60;
/// TTL of the load balancer anchor and geo tiers.
pub const DEFAULT_CNAME_TTL: i64 = 300;

/// Provider specific property holding the string-encoded weight of a branch.
pub const PROVIDER_SPECIFIC_WEIGHT: &str = "weight";
/// Provider specific property holding the geo code of a branch. `*` is the wildcard default.
pub const PROVIDER_SPECIFIC_GEO_CODE: &str = "geo-code";

/// A single DNS record set.
///
/// `dnsName` together with `setIdentifier` identifies a record when several records share a name
/// (weighted or geo branches).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub dns_name: String,
    pub targets: Vec<String>,
    pub record_type: RecordType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub set_identifier: String,
    #[serde(rename = "recordTTL", default)]
    pub record_ttl: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_specific: BTreeMap<String, String>,
}

/// Identity of a record within a zone: lower-cased name plus set identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub dns_name: String,
    pub set_identifier: String,
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.set_identifier.is_empty() {
            write!(f, "{}", self.dns_name)
        } else {
            write!(f, "{} ({})", self.dns_name, self.set_identifier)
        }
    }
}

impl Endpoint {
    pub fn new(
        dns_name: impl Into<String>,
        targets: Vec<String>,
        record_type: RecordType,
        set_identifier: impl Into<String>,
        record_ttl: i64,
    ) -> Self {
        Self {
            dns_name: dns_name.into(),
            targets,
            record_type,
            set_identifier: set_identifier.into(),
            record_ttl,
            provider_specific: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider_specific.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.provider_specific.get(name).map(String::as_str)
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            dns_name: normalize_name(&self.dns_name),
            set_identifier: self.set_identifier.clone(),
        }
    }

    /// The ordering key used by the generators: name followed by set identifier.
    pub fn sort_key(&self) -> String {
        format!("{}{}", self.dns_name, self.set_identifier)
    }

    /// Structural equality ignoring target order and name case.
    pub fn same_shape(&self, other: &Endpoint) -> bool {
        self.key() == other.key()
            && self.record_type == other.record_type
            && self.record_ttl == other.record_ttl
            && self.provider_specific == other.provider_specific
            && sorted_targets(&self.targets) == sorted_targets(&other.targets)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} [{}]",
            self.key(),
            self.record_ttl,
            self.record_type,
            self.targets.join(" ")
        )
    }
}

/// Lower-cases a DNS name and strips a trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// True when `name` equals `domain` or lies below it. Both are compared normalized.
pub fn is_within(name: &str, domain: &str) -> bool {
    let name = normalize_name(name);
    let domain = normalize_name(domain);
    name == domain || name.ends_with(&format!(".{domain}"))
}

/// Sorts endpoints by `dnsName + setIdentifier`. The sort is stable so records sharing a key keep
/// their emission order.
pub fn sort_endpoints(endpoints: &mut [Endpoint]) {
    endpoints.sort_by_key(Endpoint::sort_key);
}

fn sorted_targets(targets: &[String]) -> Vec<String> {
    let mut targets: Vec<String> = targets.iter().map(|target| normalize_name(target)).collect();
    targets.sort();
    targets.dedup();
    targets
}
