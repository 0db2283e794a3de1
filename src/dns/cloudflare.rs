//! Cloudflare backend.
//!
//! Cloudflare has no weighted or geo routing, so only plain records are supported. Each target is
//! a separate Cloudflare record. The records sharing a name and type form one endpoint, and their
//! owners are kept in the record comment as `owners=a,b`, followed by `;pending=c` when other
//! writers are waiting on the record.
//!
//! A change set is sent as a single batch request, which Cloudflare applies in one transaction.
//! The zone is re-read first and the batch is refused when any record it replaces has changed.

use super::{
    DnsProvider,
    ProviderError,
};
use crate::{
    arbitration::{
        Changes,
        ZoneRecord,
    },
    endpoint::{
        normalize_name,
        Endpoint,
    },
    resources::RecordType,
    zone::{
        Zone,
        ZoneFilter,
    },
};
use async_trait::async_trait;
use reqwest::{
    Method,
    StatusCode,
};
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use serde_json::Value;
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    time::Duration,
};

pub const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";

const OWNERS_PREFIX: &str = "owners=";
const PENDING_PREFIX: &str = "pending=";
const PER_PAGE: usize = 100;
/// Cloudflare's marker for an automatic TTL.
const AUTOMATIC_TTL: i64 = 1;

/// Wraps the cloudflare api response.
#[derive(Debug, Serialize, Deserialize)]
struct ApiResult<T> {
    #[serde(default)]
    errors: Value,
    result: T,
    result_info: Option<ApiResultInfo>,
    success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResultInfo {
    page: usize,
    total_pages: usize,
}

/// A cloudflare zone.
#[derive(Debug, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A cloudflare dns record.
///
/// See https://developers.cloudflare.com/api/operations/dns-records-for-a-zone-list-dns-records
#[derive(Debug, Serialize, Deserialize)]
pub struct DnsRecordInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    pub ttl: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Request payload for creating a new dns record.
///
/// See https://developers.cloudflare.com/api/operations/dns-records-for-a-zone-create-dns-record.
#[derive(Debug, Serialize, Deserialize)]
pub struct DnsRecordModification {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub content: String,
    pub ttl: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DnsRecordId {
    pub id: String,
}

/// Request payload for the batch endpoint. Deletes run before posts, all in one transaction.
///
/// See https://developers.cloudflare.com/api/operations/dns-records-for-a-zone-batch-dns-records
#[derive(Debug, Default, Serialize)]
pub struct DnsRecordBatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<DnsRecordId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub posts: Vec<DnsRecordModification>,
}

pub struct CloudflareApi {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    filter: ZoneFilter,
    /// Applied to every HTTP request on its own.
    request_timeout: Duration,
}

impl CloudflareApi {
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl AsRef<str>,
        api_token: impl Into<String>,
        filter: ZoneFilter,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            filter,
            request_timeout,
        }
    }

    /// List all zones the token can access.
    pub async fn list_zones(&self) -> Result<Vec<ZoneInfo>, ProviderError> {
        let url = format!("{}/zones", self.base_url);
        self.list_paginated(&url).await
    }

    /// List DNS records in a cloudflare zone.
    pub async fn list_dns_records(&self, zone_identifier: &str) -> Result<Vec<DnsRecordInfo>, ProviderError> {
        let url = format!("{}/zones/{zone_identifier}/dns_records", self.base_url);
        self.list_paginated(&url).await
    }

    /// Delete and create DNS records in one transaction. Either every operation is applied or
    /// none is.
    pub async fn batch_dns_records(&self, zone_identifier: &str, batch: DnsRecordBatch) -> Result<(), ProviderError> {
        let url = format!("{}/zones/{zone_identifier}/dns_records/batch", self.base_url);
        for record in &batch.posts {
            info!(name = ?record.name, r#type = %record.record_type, content = ?record.content, "creating dns record");
        }
        for record in &batch.deletes {
            info!(id = ?record.id, "deleting dns record");
        }
        self.request::<Value, _>(&url, Some(batch), Method::POST).await?;
        Ok(())
    }

    async fn list_paginated<R: DeserializeOwned>(&self, url: &str) -> Result<Vec<R>, ProviderError> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let paged_url = format!("{url}?page={page}&per_page={PER_PAGE}");
            let body: ApiResult<Vec<R>> = self.request_raw::<Vec<R>, ()>(&paged_url, None, Method::GET).await?;
            items.extend(body.result);
            match body.result_info {
                Some(info) if info.page < info.total_pages => page = info.page + 1,
                _ => return Ok(items),
            }
        }
    }

    async fn request<R, B>(&self, url: &str, body: Option<B>, method: Method) -> Result<R, ProviderError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        Ok(self.request_raw(url, body, method).await?.result)
    }

    async fn request_raw<R, B>(&self, url: &str, body: Option<B>, method: Method) -> Result<ApiResult<R>, ProviderError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let req = self
            .client
            .request(method, url)
            .bearer_auth(&self.api_token)
            .timeout(self.request_timeout)
            .header("Content-Type", "application/json");

        let req = if let Some(body) = body { req.json(&body) } else { req };

        let res = req.send().await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(body),
                status if status.is_server_error() => ProviderError::Server {
                    status: status.as_u16(),
                    body,
                },
                status => ProviderError::Request {
                    status: status.as_u16(),
                    body,
                },
            });
        }

        let body: ApiResult<R> = res.json().await?;
        if !body.success {
            return Err(ProviderError::Request {
                status: status.as_u16(),
                body: body.errors.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl DnsProvider for CloudflareApi {
    async fn zones(&self) -> Result<Vec<Zone>, ProviderError> {
        let zones = self.list_zones().await?;
        Ok(zones.into_iter().map(|zone| Zone::new(zone.id, zone.name)).collect())
    }

    fn filter(&self) -> &ZoneFilter {
        &self.filter
    }

    async fn records(&self, zone: &Zone) -> Result<Vec<ZoneRecord>, ProviderError> {
        let records = self.list_dns_records(&zone.id).await?;
        Ok(group_records(records))
    }

    async fn apply_changes(&self, zone: &Zone, changes: &Changes) -> Result<(), ProviderError> {
        // nothing is written unless every record can be represented
        for record in changes.create.iter().chain(&changes.update_new) {
            check_supported(&record.endpoint)?;
        }
        if changes.is_empty() {
            return Ok(());
        }

        let existing = index_records(self.list_dns_records(&zone.id).await?);
        let batch = build_batch(zone, &existing, changes)?;
        self.batch_dns_records(&zone.id, batch).await
    }
}

/// Turns a change set into a batch against the current zone content. Fails with a stale snapshot
/// when a replaced record differs from what the change set expects, or a created one exists.
fn build_batch(
    zone: &Zone,
    existing: &BTreeMap<GroupKey, (ZoneRecord, Vec<String>)>,
    changes: &Changes,
) -> Result<DnsRecordBatch, ProviderError> {
    let stale = |reason: String| ProviderError::StaleSnapshot {
        zone: zone.id.clone(),
        reason,
    };

    let mut batch = DnsRecordBatch::default();
    let mut removed = BTreeSet::new();
    for old in changes.delete.iter().chain(&changes.update_old) {
        let key = group_key(&old.endpoint);
        match existing.get(&key) {
            Some((current, ids)) if current == old => {
                batch.deletes.extend(ids.iter().map(|id| DnsRecordId { id: id.clone() }));
                removed.insert(key);
            }
            _ => return Err(stale(format!("{} was modified", old.endpoint))),
        }
    }

    for new in changes.update_new.iter().chain(&changes.create) {
        let key = group_key(&new.endpoint);
        if existing.contains_key(&key) && !removed.contains(&key) {
            return Err(stale(format!("{} already exists", new.endpoint)));
        }
        let comment = ownership_comment(&new.owners, &new.pending);
        for target in &new.endpoint.targets {
            batch.posts.push(DnsRecordModification {
                name: new.endpoint.dns_name.clone(),
                record_type: new.endpoint.record_type,
                content: target.clone(),
                ttl: if new.endpoint.record_ttl > 0 {
                    new.endpoint.record_ttl
                } else {
                    AUTOMATIC_TTL
                },
                comment: comment.clone(),
            });
        }
    }

    Ok(batch)
}

fn check_supported(endpoint: &Endpoint) -> Result<(), ProviderError> {
    let unsupported = |reason: &str| ProviderError::Unsupported {
        record: endpoint.to_string(),
        reason: reason.to_string(),
    };
    if !endpoint.set_identifier.is_empty() {
        return Err(unsupported("set identifiers require weighted or geo routing"));
    }
    if !endpoint.provider_specific.is_empty() {
        return Err(unsupported("provider specific properties require weighted or geo routing"));
    }
    Ok(())
}

type GroupKey = (String, RecordType);

fn group_key(endpoint: &Endpoint) -> GroupKey {
    (normalize_name(&endpoint.dns_name), endpoint.record_type)
}

fn ownership_comment(owners: &BTreeSet<String>, pending: &BTreeSet<String>) -> Option<String> {
    if owners.is_empty() {
        return None;
    }
    let join = |ids: &BTreeSet<String>| ids.iter().map(String::as_str).collect::<Vec<_>>().join(",");
    let mut comment = format!("{OWNERS_PREFIX}{}", join(owners));
    if !pending.is_empty() {
        comment.push_str(&format!(";{PENDING_PREFIX}{}", join(pending)));
    }
    Some(comment)
}

/// Owners and pending writers read back from a record comment. Comments not written by this
/// operator yield no owners.
fn parse_ownership(comment: Option<&str>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut owners = BTreeSet::new();
    let mut pending = BTreeSet::new();
    let Some(comment) = comment.map(str::trim).filter(|comment| comment.starts_with(OWNERS_PREFIX)) else {
        return (owners, pending);
    };

    for section in comment.split(';').map(str::trim) {
        let (ids, target) = if let Some(ids) = section.strip_prefix(OWNERS_PREFIX) {
            (ids, &mut owners)
        } else if let Some(ids) = section.strip_prefix(PENDING_PREFIX) {
            (ids, &mut pending)
        } else {
            continue;
        };
        target.extend(
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        );
    }
    (owners, pending)
}

fn group_records(records: Vec<DnsRecordInfo>) -> Vec<ZoneRecord> {
    index_records(records).into_values().map(|(record, _)| record).collect()
}

/// Folds per-target cloudflare records into one zone record per name and type, keeping the ids of
/// the cloudflare records behind each. Record types this operator doesn't manage are skipped.
fn index_records(records: Vec<DnsRecordInfo>) -> BTreeMap<GroupKey, (ZoneRecord, Vec<String>)> {
    let mut grouped: BTreeMap<GroupKey, (ZoneRecord, Vec<String>)> = BTreeMap::new();

    for info in records {
        let Ok(record_type) = info.record_type.parse::<RecordType>() else {
            trace!(name = %info.name, r#type = %info.record_type, "skipping unmanaged record type");
            continue;
        };
        let ttl = if info.ttl == AUTOMATIC_TTL { 0 } else { info.ttl };
        let (owners, pending) = parse_ownership(info.comment.as_deref());

        grouped
            .entry((normalize_name(&info.name), record_type))
            .and_modify(|(record, ids)| {
                record.endpoint.targets.push(info.content.clone());
                record.owners.extend(owners.iter().cloned());
                record.pending.extend(pending.iter().cloned());
                ids.push(info.id.clone());
            })
            .or_insert_with(|| {
                let endpoint = Endpoint::new(&info.name, vec![info.content.clone()], record_type, "", ttl);
                (ZoneRecord::new(endpoint, owners.clone()).with_pending(pending.clone()), vec![info.id.clone()])
            });
    }

    for (record, _) in grouped.values_mut() {
        record.endpoint.targets.sort();
    }
    grouped
}

#[cfg(test)]
#[path = "cloudflare_tests.rs"]
mod cloudflare_tests;
