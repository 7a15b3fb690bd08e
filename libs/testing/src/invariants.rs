//! Invariant checks over a snapshot.

use std::collections::{BTreeMap, BTreeSet};

use keyalloc_allocator::is_densely_packed;
use keyalloc_keyspace::{Assignment, Snapshot};
use thiserror::Error;

/// A broken invariant, described for test output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Violation(pub String);

fn fail<T>(message: String) -> Result<T, Violation> {
    Err(Violation(message))
}

/// Assignments held per Member key, including Members without any.
pub fn member_loads(snapshot: &Snapshot) -> BTreeMap<String, u32> {
    let layout = snapshot.layout();
    let mut loads: BTreeMap<String, u32> = snapshot
        .members()
        .map(|(entry, _)| (entry.key.clone(), 0))
        .collect();
    for (_, a) in snapshot.assignments() {
        *loads
            .entry(layout.member_key(&a.member_zone, &a.member_id))
            .or_insert(0) += 1;
    }
    loads
}

fn by_item(snapshot: &Snapshot) -> BTreeMap<&str, Vec<&Assignment>> {
    let mut items: BTreeMap<&str, Vec<&Assignment>> = BTreeMap::new();
    for (_, a) in snapshot.assignments() {
        items.entry(a.item_id.as_str()).or_default().push(a);
    }
    items
}

/// No Member holds more Assignments than its `ItemLimit`.
pub fn check_capacity(snapshot: &Snapshot) -> Result<(), Violation> {
    let loads = member_loads(snapshot);
    for (entry, member) in snapshot.members() {
        let load = loads.get(&entry.key).copied().unwrap_or(0);
        if load > member.item_limit {
            return fail(format!(
                "{} holds {} assignments over limit {}",
                entry.key, load, member.item_limit
            ));
        }
    }
    Ok(())
}

/// Every Item's Slots are exactly `0..n`.
pub fn check_dense(snapshot: &Snapshot) -> Result<(), Violation> {
    for (item, assignments) in by_item(snapshot) {
        if !is_densely_packed(&assignments) {
            let slots: Vec<u32> = assignments.iter().map(|a| a.slot).collect();
            return fail(format!("item {item} has sparse slots {slots:?}"));
        }
    }
    Ok(())
}

/// Every Item has exactly `DesiredReplication` consistent Assignments on
/// distinct, existing Members, and no Assignment outlives its Item.
pub fn check_replication(snapshot: &Snapshot) -> Result<(), Violation> {
    let mut assignments = by_item(snapshot);
    for (_, item) in snapshot.items() {
        let held = assignments.remove(item.id.as_str()).unwrap_or_default();
        if held.len() != item.desired_replication as usize {
            return fail(format!(
                "item {} has {} assignments, wants {}",
                item.id,
                held.len(),
                item.desired_replication
            ));
        }
        if let Some(a) = held.iter().find(|a| !a.consistent) {
            return fail(format!(
                "item {} slot {} on {}/{} is not consistent",
                item.id, a.slot, a.member_zone, a.member_id
            ));
        }
        let holders: BTreeSet<(&str, &str)> = held
            .iter()
            .map(|a| (a.member_zone.as_str(), a.member_id.as_str()))
            .collect();
        if holders.len() != held.len() {
            return fail(format!("item {} is held twice by one member", item.id));
        }
        if let Some((zone, id)) = holders
            .iter()
            .find(|(zone, id)| snapshot.member(zone, id).is_none())
        {
            return fail(format!("item {} is held by missing member {zone}/{id}", item.id));
        }
    }
    if let Some(item) = assignments.keys().next() {
        return fail(format!("assignments remain for removed item {item}"));
    }
    Ok(())
}

/// Every Item spans `min(DesiredReplication, zones with capacity)` Zones.
pub fn check_zone_spread(snapshot: &Snapshot) -> Result<(), Violation> {
    let zones: BTreeSet<&str> = snapshot
        .members()
        .filter(|(_, m)| !m.is_draining())
        .map(|(_, m)| m.zone.as_str())
        .collect();
    let assignments = by_item(snapshot);
    for (_, item) in snapshot.items() {
        let spanned: BTreeSet<&str> = assignments
            .get(item.id.as_str())
            .into_iter()
            .flatten()
            .map(|a| a.member_zone.as_str())
            .collect();
        let want = zones.len().min(item.desired_replication as usize);
        if spanned.len() < want {
            return fail(format!(
                "item {} spans {} zones, wants {}",
                item.id,
                spanned.len(),
                want
            ));
        }
    }
    Ok(())
}

/// All of the above.
pub fn check_converged(snapshot: &Snapshot) -> Result<(), Violation> {
    check_capacity(snapshot)?;
    check_dense(snapshot)?;
    check_replication(snapshot)
}
