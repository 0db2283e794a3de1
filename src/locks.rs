use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::sync::{
    Mutex as AsyncMutex,
    OwnedMutexGuard,
};

/// Serializes read-arbitrate-write cycles per `(zone id, root host)`.
///
/// Passes for different hosts, or the same host in different zones, never wait on each other.
#[derive(Default)]
pub struct ZoneLocks {
    locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl ZoneLocks {
    pub async fn lock(&self, zone_id: &str, root_host: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry((zone_id.to_string(), root_host.to_ascii_lowercase()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}
