//! Conflict arbitration between writers sharing a zone.
//!
//! Every record in a zone carries the set of writers (owner ids) that want it. A writer computes
//! its changes by comparing the endpoints it desires with the zone snapshot:
//!
//! - records nobody has yet are created and owned by the writer,
//! - records only the writer owns are updated in place when their shape changed,
//! - records owned by other writers are joined when the writer wants exactly the same record, and
//!   block the writer when it wants something different under the same identity,
//! - records the writer owns but no longer wants are released, and deleted once nobody owns them.
//!
//! A blocked writer leaves its id in the record's pending set. Owners of a record with pending
//! writers are blocked as well, so both sides of a conflict report it. A sole owner may still
//! reshape its record, and a pending writer that comes to agree with the record joins it.
//!
//! Two checks run before any of that and fail the pass outright. A writer may not publish a record
//! type at a name where another writer published a different type, and a CNAME target inside the
//! writer's root host must be defined by some writer.
//!
//! Arbitration is pure. Applying the resulting [`Changes`] is the caller's job.

use crate::{
    endpoint::{
        is_within,
        normalize_name,
        Endpoint,
        EndpointKey,
    },
    resources::RecordType,
};
use std::collections::{
    BTreeMap,
    BTreeSet,
};
use thiserror::Error;

/// A record as stored in a zone, together with the writers that own it and the writers blocked
/// on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRecord {
    pub endpoint: Endpoint,
    pub owners: BTreeSet<String>,
    /// Writers that want this identity in a different shape.
    pub pending: BTreeSet<String>,
}

impl ZoneRecord {
    pub fn new(endpoint: Endpoint, owners: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoint,
            owners: owners.into_iter().map(Into::into).collect(),
            pending: BTreeSet::new(),
        }
    }

    pub fn with_pending(mut self, pending: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.pending = pending.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owners.contains(owner)
    }

    pub fn is_pending_for(&self, owner: &str) -> bool {
        self.pending.contains(owner)
    }

    /// True if a writer other than `owner` is blocked on the record.
    pub fn is_contested_for(&self, owner: &str) -> bool {
        self.pending.iter().any(|other| other != owner)
    }

    /// True if anyone besides `owner` has a claim on the record. Records without any owner were
    /// not written by a writer and count as foreign.
    pub fn is_foreign_to(&self, owner: &str) -> bool {
        self.owners.is_empty() || self.owners.iter().any(|other| other != owner)
    }

    pub fn identity(&self) -> RecordIdentity {
        identity(&self.endpoint)
    }
}

/// Identity of a record within a zone: name, set identifier and type.
pub type RecordIdentity = (EndpointKey, RecordType);

pub fn identity(endpoint: &Endpoint) -> RecordIdentity {
    (endpoint.key(), endpoint.record_type)
}

/// A delta against a zone. Updates are index aligned pairs of old and new records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub create: Vec<ZoneRecord>,
    pub update_old: Vec<ZoneRecord>,
    pub update_new: Vec<ZoneRecord>,
    pub delete: Vec<ZoneRecord>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update_new.is_empty() && self.delete.is_empty()
    }

    fn update(&mut self, old: ZoneRecord, new: ZoneRecord) {
        self.update_old.push(old);
        self.update_new.push(new);
    }
}

impl std::fmt::Display for Changes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} create, {} update, {} delete",
            self.create.len(),
            self.update_new.len(),
            self.delete.len()
        )
    }
}

/// A desired record that collides with a record other writers own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incompatibility {
    pub desired: Endpoint,
    pub existing: ZoneRecord,
}

impl std::fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owners: Vec<&str> = self.existing.owners.iter().map(String::as_str).collect();
        write!(
            f,
            "{} differs from record owned by [{}]: {}",
            self.desired,
            owners.join(" "),
            self.existing.endpoint
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No blocking conflict. The changes may be empty.
    Apply(Changes),
    /// Writers disagree on the shape of records this writer wants. Nothing but the pending markers
    /// in `markers` may be written until one side changes.
    AwaitingValidation {
        incompatible: Vec<Incompatibility>,
        markers: Changes,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArbitrationError {
    #[error(
        "record type conflict, cannot update endpoint '{name}' with record type '{new}' when endpoint already exists \
         with record type '{existing}'"
    )]
    RecordTypeConflict {
        name: String,
        new: RecordType,
        existing: RecordType,
    },
    #[error(
        "invalid target, endpoint '{name}' has target '{target}' that matches the root host filters '[{}]' but does \
         not exist in the list of local or remote endpoints",
        .root_hosts.join(" ")
    )]
    InvalidTarget {
        name: String,
        target: String,
        root_hosts: Vec<String>,
    },
}

/// Decides what `owner` may write, given the endpoints it wants and the current zone contents.
///
/// `root_hosts` are the hosts the writer manages. Targets inside them must be defined by a local
/// or remote endpoint. When `desired` holds the same identity twice, the later endpoint wins.
pub fn arbitrate(
    owner: &str,
    root_hosts: &[String],
    desired: &[Endpoint],
    snapshot: &[ZoneRecord],
) -> Result<Verdict, ArbitrationError> {
    let desired: BTreeMap<RecordIdentity, &Endpoint> =
        desired.iter().map(|endpoint| (identity(endpoint), endpoint)).collect();
    let existing: BTreeMap<RecordIdentity, &ZoneRecord> =
        snapshot.iter().map(|record| (record.identity(), record)).collect();

    check_record_types(owner, &desired, snapshot)?;
    check_targets(owner, root_hosts, &desired, snapshot)?;

    let mut changes = Changes::default();
    let mut markers = Changes::default();
    let mut incompatible = Vec::new();

    for (id, endpoint) in &desired {
        let Some(current) = existing.get(id) else {
            changes.create.push(ZoneRecord::new((*endpoint).clone(), [owner]));
            continue;
        };
        let same_shape = current.endpoint.same_shape(endpoint);

        if !current.is_foreign_to(owner) && !same_shape {
            // a sole owner may reshape its record, pending writers re-evaluate against the new shape
            let updated = ZoneRecord {
                endpoint: (*endpoint).clone(),
                ..(*current).clone()
            };
            changes.update((*current).clone(), updated);
        } else if same_shape {
            if !current.is_owned_by(owner) || current.is_pending_for(owner) {
                let mut joined = (*current).clone();
                joined.owners.insert(owner.to_string());
                joined.pending.remove(owner);
                changes.update((*current).clone(), joined);
            } else if current.is_contested_for(owner) {
                incompatible.push(Incompatibility {
                    desired: (*endpoint).clone(),
                    existing: (*current).clone(),
                });
            }
        } else {
            // records nobody owns are not marked, there is no writer to tell
            if !current.owners.is_empty() && !current.is_pending_for(owner) {
                let mut marked = (*current).clone();
                marked.pending.insert(owner.to_string());
                markers.update((*current).clone(), marked);
            }
            incompatible.push(Incompatibility {
                desired: (*endpoint).clone(),
                existing: (*current).clone(),
            });
        }
    }

    if !incompatible.is_empty() {
        return Ok(Verdict::AwaitingValidation { incompatible, markers });
    }

    for record in snapshot {
        let wanted = desired.contains_key(&record.identity());
        if !wanted && (record.is_owned_by(owner) || record.is_pending_for(owner)) {
            release_record(owner, record, &mut changes);
        }
    }

    Ok(Verdict::Apply(changes))
}

/// Changes that withdraw every claim `owner` has in the zone.
pub fn release(owner: &str, snapshot: &[ZoneRecord]) -> Changes {
    let mut changes = Changes::default();
    for record in snapshot
        .iter()
        .filter(|record| record.is_owned_by(owner) || record.is_pending_for(owner))
    {
        release_record(owner, record, &mut changes);
    }
    changes
}

fn release_record(owner: &str, record: &ZoneRecord, changes: &mut Changes) {
    if record.is_owned_by(owner) && record.owners.len() == 1 {
        changes.delete.push(record.clone());
    } else {
        let mut released = record.clone();
        released.owners.remove(owner);
        released.pending.remove(owner);
        changes.update(record.clone(), released);
    }
}

fn check_record_types(
    owner: &str,
    desired: &BTreeMap<RecordIdentity, &Endpoint>,
    snapshot: &[ZoneRecord],
) -> Result<(), ArbitrationError> {
    for ((key, record_type), _) in desired {
        let conflict = snapshot.iter().find(|record| {
            record.endpoint.record_type != *record_type
                && normalize_name(&record.endpoint.dns_name) == key.dns_name
                && record.is_foreign_to(owner)
        });
        if let Some(record) = conflict {
            return Err(ArbitrationError::RecordTypeConflict {
                name: key.dns_name.clone(),
                new: *record_type,
                existing: record.endpoint.record_type,
            });
        }
    }
    Ok(())
}

fn check_targets(
    owner: &str,
    root_hosts: &[String],
    desired: &BTreeMap<RecordIdentity, &Endpoint>,
    snapshot: &[ZoneRecord],
) -> Result<(), ArbitrationError> {
    let domains: Vec<&str> = root_hosts
        .iter()
        .map(|host| host.strip_prefix("*.").unwrap_or(host))
        .collect();

    // names that survive this pass: everything wanted locally plus everything another writer keeps
    let defined: BTreeSet<String> = desired
        .keys()
        .map(|(key, _)| key.dns_name.clone())
        .chain(
            snapshot
                .iter()
                .filter(|record| record.is_foreign_to(owner))
                .map(|record| normalize_name(&record.endpoint.dns_name)),
        )
        .collect();

    for endpoint in desired.values() {
        if endpoint.record_type != RecordType::CNAME {
            continue;
        }
        for target in &endpoint.targets {
            let managed = domains.iter().any(|domain| is_within(target, domain));
            if managed && !defined.contains(&normalize_name(target)) {
                return Err(ArbitrationError::InvalidTarget {
                    name: endpoint.dns_name.clone(),
                    target: target.clone(),
                    root_hosts: root_hosts.to_vec(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "arbitration_tests.rs"]
mod arbitration_tests;
