//! Observed state: local identity and the consistency predicate.

use std::collections::HashSet;
use std::sync::Arc;

use keyalloc_keyspace::{Assignment, Entry, Item, KeySpace, Member, Snapshot};

/// Convergence status of an Item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Exactly `DesiredReplication` Assignments, all flagged consistent.
    Converged,

    /// Placement or flags are still moving toward the desired state.
    Converging,

    /// Slots are not a dense prefix from zero; packing is required.
    Diverged,
}

impl ConvergenceStatus {
    /// Returns true if the Item has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the Item is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// True iff the number of flagged Assignments equals the desired
/// replication and there are no extra Assignments.
pub fn is_consistent(item: &Item, assignments: &[&Assignment]) -> bool {
    let flagged = assignments.iter().filter(|a| a.consistent).count();
    flagged == item.desired_replication as usize && assignments.len() == flagged
}

/// True iff `kept`, the Assignments an Item retains once planned
/// departures complete, number exactly `DesiredReplication` on distinct
/// Members. Only then may a holder mark its replica consistent.
pub fn has_consistency_shape(item: &Item, kept: &[&Assignment]) -> bool {
    let holders: HashSet<(&str, &str)> = kept
        .iter()
        .map(|a| (a.member_zone.as_str(), a.member_id.as_str()))
        .collect();
    kept.len() == item.desired_replication as usize && holders.len() == kept.len()
}

/// True iff the Slots of `assignments` are exactly `0..len`.
pub fn is_densely_packed(assignments: &[&Assignment]) -> bool {
    let mut slots: Vec<u32> = assignments.iter().map(|a| a.slot).collect();
    slots.sort_unstable();
    slots.iter().enumerate().all(|(i, s)| *s as usize == i)
}

/// The local Member's view of the keyspace.
///
/// Holds no entities itself: every query is answered from a snapshot handed
/// in by the caller, so the predicate is re-evaluated fresh each round.
#[derive(Clone)]
pub struct ObservedState {
    keyspace: Arc<KeySpace>,
    zone: String,
    id: String,
    local_key: String,
}

impl ObservedState {
    /// Create the observed state of Member `(zone, id)`.
    pub fn new(keyspace: Arc<KeySpace>, zone: impl Into<String>, id: impl Into<String>) -> Self {
        let zone = zone.into();
        let id = id.into();
        let local_key = keyspace.layout().member_key(&zone, &id);
        Self {
            keyspace,
            zone,
            id,
            local_key,
        }
    }

    pub fn keyspace(&self) -> &Arc<KeySpace> {
        &self.keyspace
    }

    /// Key of the local Member. Stable for the process lifetime.
    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolve the local Member in `snapshot`.
    pub fn local_member<'s>(&self, snapshot: &'s Snapshot) -> Option<(&'s Entry, &'s Member)> {
        snapshot.member(&self.zone, &self.id)
    }

    /// Returns true if `assignment` is held by the local Member.
    pub fn is_local(&self, assignment: &Assignment) -> bool {
        assignment.member_zone == self.zone && assignment.member_id == self.id
    }

    /// See [`is_consistent`].
    pub fn is_consistent(&self, item: &Item, assignments: &[&Assignment]) -> bool {
        is_consistent(item, assignments)
    }

    /// See [`has_consistency_shape`].
    pub fn has_consistency_shape(&self, item: &Item, kept: &[&Assignment]) -> bool {
        has_consistency_shape(item, kept)
    }

    /// Classify `item` given its current Assignments.
    pub fn item_status(&self, item: &Item, assignments: &[&Assignment]) -> ConvergenceStatus {
        if !is_densely_packed(assignments) {
            ConvergenceStatus::Diverged
        } else if is_consistent(item, assignments) {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

impl std::fmt::Debug for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedState")
            .field("local_key", &self.local_key)
            .finish()
    }
}
