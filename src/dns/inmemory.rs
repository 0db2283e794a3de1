//! Process local zones.
//!
//! Zones live in a registry keyed by provider Secret, so every record referencing the same Secret
//! writes to the same zones. Changes are checked against the current zone contents and applied
//! all at once or not at all.

use super::{
    DnsProvider,
    ProviderError,
};
use crate::{
    arbitration::{
        Changes,
        RecordIdentity,
        ZoneRecord,
    },
    endpoint::is_within,
    zone::{
        Zone,
        ZoneFilter,
    },
};
use async_trait::async_trait;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::RwLock;

type ZoneRecords = BTreeMap<RecordIdentity, ZoneRecord>;

#[derive(Default)]
pub struct InMemoryZones {
    zones: RwLock<BTreeMap<String, (Zone, ZoneRecords)>>,
}

impl InMemoryZones {
    /// Makes the catalog match `domains`. Zone ids equal the domain names. Records of zones that
    /// stay listed are kept.
    async fn sync_catalog(&self, domains: &str) {
        let listed: Vec<String> = domains
            .split(',')
            .map(|domain| domain.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .collect();

        let mut zones = self.zones.write().await;
        zones.retain(|id, _| listed.contains(id));
        for domain in listed {
            zones
                .entry(domain.clone())
                .or_insert_with(|| (Zone::new(&domain, &domain), ZoneRecords::new()));
        }
    }
}

/// Zones of every in-memory provider Secret seen by this process.
#[derive(Default)]
pub struct InMemoryRegistry {
    stores: Mutex<HashMap<String, Arc<InMemoryZones>>>,
}

impl InMemoryRegistry {
    pub async fn provider(&self, key: &str, zones: &str, filter: ZoneFilter) -> InMemoryProvider {
        let store = {
            let mut stores = self.stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            stores.entry(key.to_string()).or_default().clone()
        };
        store.sync_catalog(zones).await;
        InMemoryProvider { store, filter }
    }
}

pub struct InMemoryProvider {
    store: Arc<InMemoryZones>,
    filter: ZoneFilter,
}

#[async_trait]
impl DnsProvider for InMemoryProvider {
    async fn zones(&self) -> Result<Vec<Zone>, ProviderError> {
        let zones = self.store.zones.read().await;
        Ok(zones.values().map(|(zone, _)| zone.clone()).collect())
    }

    fn filter(&self) -> &ZoneFilter {
        &self.filter
    }

    async fn records(&self, zone: &Zone) -> Result<Vec<ZoneRecord>, ProviderError> {
        let zones = self.store.zones.read().await;
        let (_, records) = zones
            .get(&zone.id)
            .ok_or_else(|| ProviderError::ZoneNotFound(zone.id.clone()))?;
        Ok(records.values().cloned().collect())
    }

    async fn apply_changes(&self, zone: &Zone, changes: &Changes) -> Result<(), ProviderError> {
        let mut zones = self.store.zones.write().await;
        let (stored_zone, stored) = zones
            .get_mut(&zone.id)
            .ok_or_else(|| ProviderError::ZoneNotFound(zone.id.clone()))?;

        let stale = |reason: String| ProviderError::StaleSnapshot {
            zone: zone.id.clone(),
            reason,
        };

        for record in changes.create.iter().chain(&changes.update_new) {
            if !is_within(&record.endpoint.dns_name, &stored_zone.domain_name) {
                return Err(ProviderError::Unsupported {
                    record: record.endpoint.dns_name.clone(),
                    reason: format!("outside of zone {}", stored_zone.domain_name),
                });
            }
        }

        let mut next = stored.clone();

        for old in changes.update_old.iter().chain(&changes.delete) {
            if next.get(&old.identity()) != Some(old) {
                return Err(stale(format!("{} was modified", old.endpoint)));
            }
        }
        for old in changes.delete.iter().chain(&changes.update_old) {
            next.remove(&old.identity());
        }
        for new in changes.update_new.iter().chain(&changes.create) {
            if next.insert(new.identity(), new.clone()).is_some() {
                return Err(stale(format!("{} already exists", new.endpoint)));
            }
        }

        debug!(zone = %stored_zone, %changes, "applied changes");
        *stored = next;
        Ok(())
    }
}
