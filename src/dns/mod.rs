//! DNS providers.
//!
//! A provider exposes a catalog of zones and the records in each zone together with their owner
//! sets. Providers are configured by Secrets whose type selects the backend.

pub mod cloudflare;
pub mod inmemory;

use crate::{
    arbitration::{
        Changes,
        ZoneRecord,
    },
    zone::{
        Zone,
        ZoneFilter,
    },
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt as _;
use std::{
    collections::BTreeMap,
    time::Duration,
};
use thiserror::Error;

pub const PROVIDER_TYPE_INMEMORY: &str = "dns.multicluster.io/inmemory";
pub const PROVIDER_TYPE_CLOUDFLARE: &str = "dns.multicluster.io/cloudflare";

pub const KEY_ZONES: &str = "ZONES";
pub const KEY_CLOUDFLARE_API_TOKEN: &str = "CLOUDFLARE_API_TOKEN";
pub const KEY_ZONE_DOMAIN_FILTER: &str = "ZONE_DOMAIN_FILTER";
pub const KEY_ZONE_ID_FILTER: &str = "ZONE_ID_FILTER";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider server error: status={status}, body={body:?}")]
    Server { status: u16, body: String },
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("provider rejected request: status={status}, body={body:?}")]
    Request { status: u16, body: String },
    #[error("zone {0} not found")]
    ZoneNotFound(String),
    #[error("zone {zone} changed since it was read: {reason}")]
    StaleSnapshot { zone: String, reason: String },
    #[error("record {record} is not supported by this provider: {reason}")]
    Unsupported { record: String, reason: String },
    #[error("invalid provider secret {secret}: {reason}")]
    InvalidSecret { secret: String, reason: String },
}

impl ProviderError {
    /// Transient errors may succeed when the same call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::RateLimited | ProviderError::Server { .. } => true,
            ProviderError::Http(err) => !err.is_decode() && !err.is_builder(),
            _ => false,
        }
    }
}

/// A DNS backend holding zones shared by many writers.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Zones this provider may write to, before filtering.
    async fn zones(&self) -> Result<Vec<Zone>, ProviderError>;

    /// Domain and id restrictions configured on the provider.
    fn filter(&self) -> &ZoneFilter;

    /// Every record in the zone, whoever wrote it.
    async fn records(&self, zone: &Zone) -> Result<Vec<ZoneRecord>, ProviderError>;

    /// Applies `changes` to the zone.
    async fn apply_changes(&self, zone: &Zone, changes: &Changes) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    InMemory,
    Cloudflare,
}

/// Provider configuration decoded from a Secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    /// `{ns}/{name}` of the Secret.
    pub key: String,
    pub kind: ProviderKind,
    pub values: BTreeMap<String, String>,
    pub filter: ZoneFilter,
}

impl ProviderDescriptor {
    pub fn from_secret(secret: &Secret) -> Result<Self, ProviderError> {
        let key = format!("{}/{}", secret.namespace().unwrap_or_default(), secret.name_any());
        let invalid = |reason: String| ProviderError::InvalidSecret {
            secret: key.clone(),
            reason,
        };

        let kind = match secret.type_.as_deref() {
            Some(PROVIDER_TYPE_INMEMORY) => ProviderKind::InMemory,
            Some(PROVIDER_TYPE_CLOUDFLARE) => ProviderKind::Cloudflare,
            other => return Err(invalid(format!("unsupported provider type {other:?}"))),
        };

        let values = secret_values(secret);
        if kind == ProviderKind::Cloudflare && values.get(KEY_CLOUDFLARE_API_TOKEN).map_or(true, String::is_empty) {
            return Err(invalid(format!("missing {KEY_CLOUDFLARE_API_TOKEN}")));
        }

        let filter = ZoneFilter::from_lists(
            values.get(KEY_ZONE_DOMAIN_FILTER).map(String::as_str),
            values.get(KEY_ZONE_ID_FILTER).map(String::as_str),
        );

        Ok(Self {
            key,
            kind,
            values,
            filter,
        })
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Builds provider clients from descriptors.
pub struct ProviderFactory {
    pub inmemory: inmemory::InMemoryRegistry,
    pub cloudflare_base_url: String,
    /// Timeout of a single provider HTTP request.
    pub request_timeout: Duration,
    http: reqwest::Client,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new(cloudflare::CLOUDFLARE_API_URL, DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ProviderFactory {
    pub fn new(cloudflare_base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            inmemory: Default::default(),
            cloudflare_base_url: cloudflare_base_url.into(),
            request_timeout,
            http: reqwest::Client::new(),
        }
    }

    pub async fn build(&self, descriptor: &ProviderDescriptor) -> Result<Box<dyn DnsProvider>, ProviderError> {
        match descriptor.kind {
            ProviderKind::InMemory => {
                let zones = descriptor.value(KEY_ZONES).unwrap_or_default();
                let provider = self
                    .inmemory
                    .provider(&descriptor.key, zones, descriptor.filter.clone())
                    .await;
                Ok(Box::new(provider))
            }
            ProviderKind::Cloudflare => {
                let api_token = descriptor.value(KEY_CLOUDFLARE_API_TOKEN).unwrap_or_default();
                Ok(Box::new(cloudflare::CloudflareApi::with_client(
                    self.http.clone(),
                    &self.cloudflare_base_url,
                    api_token,
                    descriptor.filter.clone(),
                    self.request_timeout,
                )))
            }
        }
    }
}

/// Values of a Secret, `stringData` taking precedence over `data`. `data` values are read as UTF-8
/// and fall back to base64 for values that were encoded twice.
fn secret_values(secret: &Secret) -> BTreeMap<String, String> {
    use base64::prelude::*;

    let mut values = BTreeMap::new();
    for (key, bytes) in secret.data.iter().flatten() {
        if let Ok(decoded) = String::from_utf8(bytes.0.clone()) {
            values.insert(key.clone(), decoded.trim().to_string());
            continue;
        }
        match BASE64_STANDARD
            .decode(&bytes.0)
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
        {
            Some(decoded) => {
                values.insert(key.clone(), decoded.trim().to_string());
            }
            None => error!(%key, "unable to decode provider secret value as utf8 or base64"),
        }
    }
    for (key, value) in secret.string_data.iter().flatten() {
        values.insert(key.clone(), value.trim().to_string());
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn secret(type_: &str, data: &[(&str, &str)], string_data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("provider".to_string()),
                namespace: Some("dns".to_string()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            string_data: Some(string_data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn inmemory_descriptor_with_filters() {
        let descriptor = ProviderDescriptor::from_secret(&secret(
            PROVIDER_TYPE_INMEMORY,
            &[(KEY_ZONES, "example.com,example.org"), (KEY_ZONE_DOMAIN_FILTER, "example.com")],
            &[],
        ))
        .unwrap();

        assert_eq!(descriptor.key, "dns/provider");
        assert_eq!(descriptor.kind, ProviderKind::InMemory);
        assert_eq!(descriptor.value(KEY_ZONES), Some("example.com,example.org"));
        assert_eq!(descriptor.filter.domains, vec!["example.com".to_string()]);
        assert!(descriptor.filter.ids.is_empty());
    }

    #[test]
    fn string_data_wins_and_base64_is_decoded() {
        let mut binary = secret(PROVIDER_TYPE_CLOUDFLARE, &[], &[]);
        binary.data = Some(BTreeMap::from([(
            KEY_CLOUDFLARE_API_TOKEN.to_string(),
            ByteString(vec![0xff, 0xfe]),
        )]));
        assert_eq!(secret_values(&binary).get(KEY_CLOUDFLARE_API_TOKEN), None);

        let descriptor = ProviderDescriptor::from_secret(&secret(
            PROVIDER_TYPE_CLOUDFLARE,
            &[(KEY_CLOUDFLARE_API_TOKEN, "old")],
            &[(KEY_CLOUDFLARE_API_TOKEN, "new")],
        ))
        .unwrap();
        assert_eq!(descriptor.value(KEY_CLOUDFLARE_API_TOKEN), Some("new"));
    }

    #[test]
    fn invalid_secrets_are_rejected() {
        let err = ProviderDescriptor::from_secret(&secret("Opaque", &[], &[])).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidSecret { .. }));

        let err = ProviderDescriptor::from_secret(&secret(PROVIDER_TYPE_CLOUDFLARE, &[], &[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid provider secret dns/provider: missing CLOUDFLARE_API_TOKEN"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::Server {
            status: 502,
            body: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Unauthorized("nope".to_string()).is_transient());
        assert!(!ProviderError::ZoneNotFound("zone-1".to_string()).is_transient());
    }
}
