//! Owner identity of a writer.
//!
//! The owner id is fixed by the first reconciliation: the explicit `spec.ownerID` if given,
//! otherwise a hash of the resource UID. After that it can't be set, changed or cleared.

use crate::hash::{
    base36_hash,
    OWNER_ID_LENGTH,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OwnerIdError {
    #[error("OwnerID can't be set if it was previously unset")]
    SetAfterUnset,
    #[error("OwnerID can't be unset if it was previously set")]
    UnsetAfterSet,
    #[error("OwnerID is immutable")]
    Changed,
}

/// Owner id derived from a resource UID.
pub fn owner_id_from_uid(uid: &str) -> String {
    base36_hash(uid, OWNER_ID_LENGTH)
}

/// The owner id to use for this pass.
///
/// `requested` is `spec.ownerID`, `assigned` the value recorded in status by an earlier pass.
pub fn resolve_owner_id(requested: Option<&str>, assigned: Option<&str>, uid: &str) -> Result<String, OwnerIdError> {
    let derived = owner_id_from_uid(uid);
    let requested = requested.filter(|owner| !owner.is_empty());

    let Some(assigned) = assigned.filter(|owner| !owner.is_empty()) else {
        return Ok(requested.map_or(derived, str::to_string));
    };

    match requested {
        Some(requested) if requested == assigned => Ok(assigned.to_string()),
        Some(_) if assigned == derived => Err(OwnerIdError::SetAfterUnset),
        Some(_) => Err(OwnerIdError::Changed),
        None if assigned == derived => Ok(derived),
        None => Err(OwnerIdError::UnsetAfterSet),
    }
}
