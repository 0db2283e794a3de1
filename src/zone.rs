//! Zone assignment.
//!
//! A root host is published into exactly one zone of its provider: the most specific zone whose
//! domain is a proper parent of the host and that passes the provider's filters.

use crate::endpoint::normalize_name;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: String,
    pub domain_name: String,
}

impl Zone {
    pub fn new(id: impl Into<String>, domain_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain_name: domain_name.into(),
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.domain_name, self.id)
    }
}

/// Provider side restrictions on which zones may be written. Empty lists allow everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneFilter {
    /// A zone passes if its domain equals or lies below one of these domains.
    pub domains: Vec<String>,
    /// A zone passes if its id is one of these.
    pub ids: Vec<String>,
}

impl ZoneFilter {
    /// Parses comma separated filter values, ignoring blanks.
    pub fn from_lists(domains: Option<&str>, ids: Option<&str>) -> Self {
        Self {
            domains: split_list(domains),
            ids: split_list(ids),
        }
    }

    pub fn check(&self, zone: &Zone) -> Result<(), ZoneError> {
        if !self.domains.is_empty()
            && !self
                .domains
                .iter()
                .any(|domain| crate::endpoint::is_within(&zone.domain_name, domain))
        {
            return Err(ZoneError::DomainFiltered {
                domain_name: zone.domain_name.clone(),
            });
        }
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == zone.id) {
            return Err(ZoneError::IdFiltered { id: zone.id.clone() });
        }
        Ok(())
    }

    pub fn allows(&self, zone: &Zone) -> bool {
        self.check(zone).is_ok()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZoneError {
    #[error("no valid zone found for host: {host}")]
    NoSuitableZone { host: String },
    #[error("zone domain name '{domain_name}' is not listed in the providers domain filter")]
    DomainFiltered { domain_name: String },
    #[error("zone id '{id}' is not listed in the providers zone id filter")]
    IdFiltered { id: String },
}

/// Selects the zone `host` is published into.
///
/// Candidates are zones whose domain is a proper suffix of the host on a label boundary and that
/// pass `filter`. The longest domain wins. Equal lengths are broken by the smaller zone id so the
/// result never depends on catalog order.
pub fn select_zone<'a>(host: &str, catalog: &'a [Zone], filter: &ZoneFilter) -> Result<&'a Zone, ZoneError> {
    let host = normalize_name(host);

    let selected = catalog
        .iter()
        .filter(|zone| {
            let domain = normalize_name(&zone.domain_name);
            !domain.is_empty() && host.ends_with(&format!(".{domain}"))
        })
        .filter(|zone| filter.allows(zone))
        .min_by(|a, b| {
            normalize_name(&b.domain_name)
                .len()
                .cmp(&normalize_name(&a.domain_name).len())
                .then_with(|| a.id.cmp(&b.id))
        });

    selected.ok_or(ZoneError::NoSuitableZone { host })
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "zone_tests.rs"]
mod zone_tests;
