//! Allocation engine.
//!
//! Each round, every Member computes the same deterministic *plan* from its
//! snapshot and then proposes only the writes it is entitled to make:
//! - claiming a Slot for itself (an add)
//! - releasing its own Assignment (a remove), packing the freed Slot
//! - flagging its own Assignments consistent
//! - bounded repair of Assignments left behind by departed Members or Items
//!
//! Placement is sticky: the plan is a diff against current Assignments,
//! never a recompute from scratch. Moves are make-before-break: a leaving
//! Assignment is released only once the Item keeps `DesiredReplication`
//! consistent Assignments without it.
//!
//! Every write is conditioned on the touched Items being unchanged since the
//! snapshot revision, so a concurrent round by another Member turns into a
//! conflict and a retry, never a lost update.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use keyalloc_keyspace::{
    encode_assignment_value, Assignment, Compare, Entry, Item, Member, Op, Snapshot, Txn,
    PENDING,
};
use tracing::trace;

use crate::error::{AllocatorError, AllocatorResult};
use crate::state::{ConvergenceStatus, ObservedState};

/// Default bound on write operations per transaction.
pub const DEFAULT_MAX_TXN_OPS: usize = 128;

/// Default bound on repair operations (and zone-spread moves) per round.
pub const DEFAULT_REPAIR_BUDGET: usize = 32;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum write operations in one round's transaction.
    pub max_txn_ops: usize,

    /// Maximum repair deletions, and separately zone-spread moves, planned
    /// per round.
    pub repair_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_txn_ops: DEFAULT_MAX_TXN_OPS,
            repair_budget: DEFAULT_REPAIR_BUDGET,
        }
    }
}

/// Counts of the changes a proposal makes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub added: u64,
    pub removed: u64,
    pub packed: u64,
    pub flagged: u64,
    pub repaired: u64,
}

impl RoundStats {
    /// True if at least one write is proposed.
    pub fn made_progress(&self) -> bool {
        self.added + self.removed + self.packed + self.flagged + self.repaired > 0
    }

    /// Add `other` into `self`.
    pub fn merge(&mut self, other: &RoundStats) {
        self.added += other.added;
        self.removed += other.removed;
        self.packed += other.packed;
        self.flagged += other.flagged;
        self.repaired += other.repaired;
    }
}

/// The local Member's share of one round's plan.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Revision of the snapshot the proposal was computed from.
    pub revision: i64,
    pub txn: Txn,
    pub stats: RoundStats,
    /// The local Member is draining and holds no Assignments.
    pub drained: bool,
    /// Work was left for a later round because of `max_txn_ops`.
    pub deferred: bool,
}

impl Proposal {
    /// True if the proposal writes nothing.
    pub fn is_empty(&self) -> bool {
        self.txn.is_empty()
    }
}

struct MemberLoad<'s> {
    key: &'s str,
    member: &'s Member,
    /// Every Assignment key held, including those of removed Items.
    load: u32,
    /// Assignments of Items that still exist.
    load_live: u32,
    /// Capacity left for additions, decremented as the plan places replicas.
    spare: u32,
}

#[derive(Clone, Copy)]
struct Replica<'s> {
    key: &'s str,
    assignment: &'s Assignment,
    /// Index of the holder in the member table; `None` if it is gone.
    member: Option<usize>,
}

impl Replica<'_> {
    fn slot(&self) -> u32 {
        self.assignment.slot
    }

    fn zone(&self) -> &str {
        &self.assignment.member_zone
    }
}

#[derive(Default)]
struct ItemWork {
    compares: Vec<Compare>,
    ops: Vec<Op>,
    stats: RoundStats,
}

struct Planner<'s, 'c> {
    snapshot: &'s Snapshot,
    config: &'c EngineConfig,
    state: &'c ObservedState,
    members: Vec<MemberLoad<'s>>,
    local: usize,
    /// Repairs orphans of Items no live Member holds: the first Member in
    /// key order that is not draining.
    steward: usize,
    repairs_left: usize,
    zone_moves_left: usize,
    txn: Txn,
    stats: RoundStats,
    deferred: bool,
}

/// Compute the local Member's proposal for one round.
///
/// Pure over `snapshot`: the same snapshot always yields the same proposal.
pub fn propose(
    snapshot: &Snapshot,
    state: &ObservedState,
    config: &EngineConfig,
) -> AllocatorResult<Proposal> {
    let not_found = || AllocatorError::MemberNotFound(state.local_key().to_string());
    let (local_entry, _) = state.local_member(snapshot).ok_or_else(not_found)?;

    let index: HashMap<(&str, &str), usize> = snapshot
        .members()
        .enumerate()
        .map(|(i, (_, m))| ((m.zone.as_str(), m.id.as_str()), i))
        .collect();
    let local = *index.get(&(state.zone(), state.id())).ok_or_else(not_found)?;

    let mut members: Vec<MemberLoad> = snapshot
        .members()
        .map(|(entry, member)| MemberLoad {
            key: entry.key.as_str(),
            member,
            load: 0,
            load_live: 0,
            spare: 0,
        })
        .collect();

    let mut by_item: BTreeMap<&str, Vec<Replica>> = BTreeMap::new();
    for (entry, assignment) in snapshot.assignments() {
        let member = index
            .get(&(
                assignment.member_zone.as_str(),
                assignment.member_id.as_str(),
            ))
            .copied();
        if let Some(m) = member {
            members[m].load += 1;
        }
        by_item
            .entry(assignment.item_id.as_str())
            .or_default()
            .push(Replica {
                key: entry.key.as_str(),
                assignment,
                member,
            });
    }
    for replicas in by_item.values_mut() {
        replicas.sort_by(|a, b| (a.slot(), a.key).cmp(&(b.slot(), b.key)));
    }

    let items: BTreeMap<&str, (&Entry, &Item)> = snapshot
        .items()
        .map(|(entry, item)| (item.id.as_str(), (entry, item)))
        .collect();

    for (item_id, replicas) in &by_item {
        if items.contains_key(item_id) {
            for m in replicas.iter().filter_map(|r| r.member) {
                members[m].load_live += 1;
            }
        }
    }
    for m in members.iter_mut() {
        m.spare = m.member.item_limit.saturating_sub(m.load);
    }

    if members[local].member.is_draining() && members[local].load == 0 {
        return Ok(Proposal {
            revision: snapshot.revision(),
            txn: Txn::new(),
            stats: RoundStats::default(),
            drained: true,
            deferred: false,
        });
    }

    let shedding = select_shedding(&members, &by_item, &items);
    let steward = members
        .iter()
        .position(|m| !m.member.is_draining())
        .unwrap_or(local);

    let mut planner = Planner {
        snapshot,
        config,
        state,
        members,
        local,
        steward,
        repairs_left: config.repair_budget,
        zone_moves_left: config.repair_budget,
        txn: Txn::new(),
        stats: RoundStats::default(),
        deferred: false,
    };

    let ids: BTreeSet<&str> = items.keys().chain(by_item.keys()).copied().collect();
    for id in ids {
        let replicas = by_item.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let work = match items.get(id) {
            Some(&(entry, item)) => planner.plan_item(entry, item, replicas, &shedding),
            None => planner.plan_removed_item(id, replicas),
        };
        if !planner.commit(work) {
            break;
        }
    }

    let mut txn = planner.txn;
    if !txn.is_empty() {
        txn.compares.push(Compare::ModRevision {
            key: state.local_key().to_string(),
            revision: local_entry.mod_revision,
        });
    }

    trace!(
        revision = snapshot.revision(),
        ops = txn.ops.len(),
        deferred = planner.deferred,
        "Computed proposal"
    );

    Ok(Proposal {
        revision: snapshot.revision(),
        txn,
        stats: planner.stats,
        drained: false,
        deferred: planner.deferred,
    })
}

/// Pick the Assignments each over-capacity Member must shed.
///
/// Order: Items that are already over-replicated (their replacement exists),
/// then highest Slot, then Item key. The choice stays stable while a move is
/// in flight.
fn select_shedding<'s>(
    members: &[MemberLoad<'s>],
    by_item: &BTreeMap<&'s str, Vec<Replica<'s>>>,
    items: &BTreeMap<&'s str, (&'s Entry, &'s Item)>,
) -> HashSet<&'s str> {
    let mut candidates: HashMap<usize, Vec<(bool, u32, &'s str, &'s str)>> = HashMap::new();
    for (item_id, replicas) in by_item {
        let Some((_, item)) = items.get(item_id) else {
            continue;
        };
        let over = replicas.len() > item.desired_replication as usize;
        for r in replicas {
            let Some(m) = r.member else { continue };
            if members[m].load_live > members[m].member.item_limit {
                candidates
                    .entry(m)
                    .or_default()
                    .push((over, r.slot(), *item_id, r.key));
            }
        }
    }

    let mut shedding = HashSet::new();
    for (m, mut list) in candidates {
        list.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(b.2)));
        let excess = (members[m].load_live - members[m].member.item_limit) as usize;
        shedding.extend(list.into_iter().take(excess).map(|c| c.3));
    }
    shedding
}

/// True if Slots of `replicas` (sorted by Slot) are exactly `0..len`.
fn is_dense(replicas: &[Replica]) -> bool {
    replicas
        .iter()
        .enumerate()
        .all(|(i, r)| r.slot() as usize == i)
}

/// Renumbering that makes `remaining` (sorted by Slot) a dense prefix.
///
/// Replicas outside `0..len`, or colliding on a Slot, move; the highest Slot
/// fills the lowest gap first.
fn pack_moves<'s>(remaining: &[Replica<'s>]) -> Vec<(Replica<'s>, u32)> {
    let n = remaining.len();
    let mut taken = vec![false; n];
    let mut movers = Vec::new();
    for r in remaining {
        let slot = r.slot() as usize;
        if slot < n && !taken[slot] {
            taken[slot] = true;
        } else {
            movers.push(*r);
        }
    }
    let gaps = taken
        .iter()
        .enumerate()
        .filter(|(_, t)| !**t)
        .map(|(s, _)| s as u32);
    movers.into_iter().rev().zip(gaps).collect()
}

fn zone_counts<'s>(replicas: impl Iterator<Item = &'s Replica<'s>>) -> BTreeMap<&'s str, usize> {
    let mut counts = BTreeMap::new();
    for r in replicas {
        *counts.entry(r.assignment.member_zone.as_str()).or_insert(0) += 1;
    }
    counts
}

impl<'s> Planner<'s, '_> {
    /// Append `work` to the transaction. Returns false once the op bound is
    /// reached.
    fn commit(&mut self, work: ItemWork) -> bool {
        if work.ops.is_empty() {
            return true;
        }
        if !self.txn.ops.is_empty() && self.txn.ops.len() + work.ops.len() > self.config.max_txn_ops
        {
            self.deferred = true;
            return false;
        }
        self.txn.compares.extend(work.compares);
        self.txn.ops.extend(work.ops);
        self.stats.merge(&work.stats);
        true
    }

    fn item_compares(&self, item_id: &str, item_revision: i64) -> Vec<Compare> {
        let layout = self.snapshot.layout();
        vec![
            Compare::ModRevision {
                key: layout.item_key(item_id),
                revision: item_revision,
            },
            Compare::PrefixUnchanged {
                prefix: layout.item_assignments_prefix(item_id),
                revision: self.snapshot.revision(),
            },
        ]
    }

    fn is_local(&self, replica: &Replica) -> bool {
        replica.member == Some(self.local)
    }

    /// Assignments of an Item that no longer exists, released from the top
    /// Slot down so the rest stay a dense prefix. The holder of the top Slot
    /// releases it; the steward releases it if orphaned.
    fn plan_removed_item(&mut self, item_id: &str, replicas: &[Replica<'s>]) -> ItemWork {
        let mut work = ItemWork::default();
        let Some(top) = replicas.last() else {
            return work;
        };
        if self.repairs_left == 0 {
            return work;
        }
        let orphan = top.member.is_none();
        if self.is_local(top) || (orphan && self.steward == self.local) {
            if orphan {
                work.compares.push(self.absent_member(top));
            }
            work.ops.push(Op::Delete {
                key: top.key.to_string(),
            });
            work.stats.repaired += 1;
            self.repairs_left -= 1;
        }
        if !work.ops.is_empty() {
            work.compares.extend(self.item_compares(item_id, 0));
        }
        work
    }

    fn absent_member(&self, replica: &Replica) -> Compare {
        Compare::ModRevision {
            key: self
                .snapshot
                .layout()
                .member_key(replica.zone(), &replica.assignment.member_id),
            revision: 0,
        }
    }

    fn plan_item(
        &mut self,
        entry: &Entry,
        item: &Item,
        replicas: &[Replica<'s>],
        shedding: &HashSet<&str>,
    ) -> ItemWork {
        let desired = item.desired_replication as usize;

        // Live replicas: one per existing Member, lowest Slot wins. The rest
        // (orphans and duplicates) are repaired.
        let mut live: Vec<Replica> = Vec::with_capacity(replicas.len());
        let mut broken: Vec<Replica> = Vec::new();
        let mut seen = HashSet::new();
        for r in replicas {
            match r.member {
                Some(m) if seen.insert(m) => live.push(*r),
                _ => broken.push(*r),
            }
        }
        let holders: HashSet<usize> = replicas.iter().filter_map(|r| r.member).collect();

        let mut leaving: Vec<bool> = live.iter().map(|r| shedding.contains(r.key)).collect();
        self.plan_zone_repair(&live, &mut leaving, &holders, desired);

        let staying: Vec<usize> = (0..live.len()).filter(|i| !leaving[*i]).collect();
        let receivers = if staying.len() < desired {
            self.choose_receivers(&live, &staying, &holders, desired - staying.len())
        } else {
            Vec::new()
        };
        let excess = if staying.len() > desired {
            choose_excess(&live, &staying, staying.len() - desired)
        } else {
            Vec::new()
        };

        // A kept replica is flagged only once the Item keeps exactly
        // `DesiredReplication` replicas after planned departures.
        let kept: Vec<&Assignment> = staying
            .iter()
            .filter(|i| !excess.contains(i))
            .map(|i| live[*i].assignment)
            .collect();
        let all: Vec<&Assignment> = replicas.iter().map(|r| r.assignment).collect();
        let shaped = broken.is_empty() && self.state.has_consistency_shape(item, &kept);
        let packed = self.state.item_status(item, &all) != ConvergenceStatus::Diverged;

        let mut work = ItemWork::default();
        let mut deletions: Vec<Replica> = Vec::new();

        // Release the local replica if it is leaving or excess, and the Item
        // keeps enough consistent replicas without it.
        let local_idx = live.iter().position(|r| self.is_local(r));
        let mut local_kept = false;
        if let Some(li) = local_idx {
            if leaving[li] || excess.contains(&li) {
                let remaining = live.iter().enumerate().filter(|(i, _)| *i != li);
                let flagged = remaining.clone().filter(|(_, r)| r.assignment.consistent).count();
                if remaining.count() >= desired && flagged >= desired {
                    deletions.push(live[li]);
                    work.stats.removed += 1;
                }
            } else {
                local_kept = true;
            }
        }

        // Repair: own duplicates, and orphans if this Member is the Item's
        // repair owner (holder of its lowest live Slot, else the steward).
        let repair_owner = live.first().and_then(|r| r.member).unwrap_or(self.steward);
        for r in &broken {
            if self.repairs_left == 0 {
                break;
            }
            let orphan = r.member.is_none();
            if self.is_local(r) || (orphan && repair_owner == self.local) {
                if orphan {
                    work.compares.push(self.absent_member(r));
                }
                deletions.push(*r);
                work.stats.repaired += 1;
                self.repairs_left -= 1;
            }
        }

        let moves = if !deletions.is_empty() {
            let remaining: Vec<Replica> = replicas
                .iter()
                .filter(|r| !deletions.iter().any(|d| d.key == r.key))
                .copied()
                .collect();
            pack_moves(&remaining)
        } else if !is_dense(replicas) {
            // Gaps left by others are packed by the holder of the top Slot.
            pack_moves(replicas)
                .into_iter()
                .take(1)
                .filter(|(r, _)| self.is_local(r))
                .collect()
        } else {
            Vec::new()
        };

        for d in &deletions {
            work.ops.push(Op::Delete {
                key: d.key.to_string(),
            });
        }

        let layout = self.snapshot.layout();
        let mut local_flagged = false;
        for (r, slot) in &moves {
            let mut value = r.assignment.encode_value();
            if self.is_local(r) && local_kept && shaped && !r.assignment.consistent {
                value = encode_assignment_value(true);
                work.stats.flagged += 1;
                local_flagged = true;
            }
            work.ops.push(Op::Delete {
                key: r.key.to_string(),
            });
            work.ops.push(Op::Put {
                key: layout.assignment_key(&item.id, r.zone(), &r.assignment.member_id, *slot),
                value,
            });
            work.stats.packed += 1;
        }

        // Claim the next dense Slot if this Member is the first receiver.
        if deletions.is_empty() && moves.is_empty() && is_dense(replicas) {
            if receivers.first() == Some(&self.local) {
                let member = self.members[self.local].member;
                work.ops.push(Op::Put {
                    key: layout.assignment_key(
                        &item.id,
                        &member.zone,
                        &member.id,
                        replicas.len() as u32,
                    ),
                    value: PENDING.to_vec(),
                });
                work.stats.added += 1;
            }
        }

        if let Some(li) = local_idx {
            let r = live[li];
            let unflagged = !local_flagged && !r.assignment.consistent;
            if local_kept && shaped && packed && unflagged {
                work.ops.push(Op::Put {
                    key: r.key.to_string(),
                    value: encode_assignment_value(true),
                });
                work.stats.flagged += 1;
            }
        }

        if !work.ops.is_empty() {
            work.compares.extend(self.item_compares(&item.id, entry.mod_revision));
        }
        work
    }

    /// Mark one replica of an over-concentrated Item as leaving, if a Zone
    /// the Item is absent from has a Member with spare capacity.
    fn plan_zone_repair(
        &mut self,
        live: &[Replica],
        leaving: &mut [bool],
        holders: &HashSet<usize>,
        desired: usize,
    ) {
        if self.zone_moves_left == 0 {
            return;
        }
        let staying = live.iter().zip(leaving.iter()).filter(|(_, l)| !**l).map(|(r, _)| r);
        if staying.clone().count() < desired {
            return;
        }
        let counts = zone_counts(staying);
        let Some((&crowded, &most)) = counts.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            return;
        };
        if most < 2 {
            return;
        }
        let open_zone = self.members.iter().enumerate().any(|(i, m)| {
            m.spare > 0 && !holders.contains(&i) && !counts.contains_key(m.member.zone.as_str())
        });
        if !open_zone {
            return;
        }
        let pick = (0..live.len())
            .filter(|i| !leaving[*i] && live[*i].zone() == crowded)
            .max_by_key(|i| live[*i].slot());
        if let Some(i) = pick {
            leaving[i] = true;
            self.zone_moves_left -= 1;
        }
    }

    /// Choose `need` receivers, one at a time: fewest replicas already in
    /// the candidate's Zone, then most spare, then smallest Member key.
    fn choose_receivers(
        &mut self,
        live: &[Replica],
        staying: &[usize],
        holders: &HashSet<usize>,
        need: usize,
    ) -> Vec<usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for i in staying {
            *counts.entry(live[*i].zone().to_string()).or_insert(0) += 1;
        }

        let mut candidates: Vec<usize> = (0..self.members.len())
            .filter(|i| self.members[*i].spare > 0 && !holders.contains(i))
            .collect();
        let mut receivers = Vec::with_capacity(need);

        while receivers.len() < need {
            let best = candidates.iter().enumerate().min_by(|(_, a), (_, b)| {
                let (ma, mb) = (&self.members[**a], &self.members[**b]);
                let za = counts.get(ma.member.zone.as_str()).copied().unwrap_or(0);
                let zb = counts.get(mb.member.zone.as_str()).copied().unwrap_or(0);
                za.cmp(&zb)
                    .then(mb.spare.cmp(&ma.spare))
                    .then(ma.key.cmp(mb.key))
            });
            let Some((pos, &chosen)) = best else { break };
            candidates.swap_remove(pos);

            let member = &mut self.members[chosen];
            member.spare -= 1;
            *counts.entry(member.member.zone.clone()).or_insert(0) += 1;
            receivers.push(chosen);
        }
        receivers
    }
}

/// Choose `excess` staying replicas to drop, one at a time: most crowded
/// Zone first, then highest Slot.
fn choose_excess(live: &[Replica], staying: &[usize], excess: usize) -> Vec<usize> {
    let mut counts = zone_counts(staying.iter().map(|i| &live[*i]));
    let mut remaining: Vec<usize> = staying.to_vec();
    let mut chosen = Vec::with_capacity(excess);

    while chosen.len() < excess {
        let best = remaining.iter().enumerate().max_by(|(_, a), (_, b)| {
            let (ra, rb) = (&live[**a], &live[**b]);
            let za = counts.get(ra.zone()).copied().unwrap_or(0);
            let zb = counts.get(rb.zone()).copied().unwrap_or(0);
            za.cmp(&zb).then(ra.slot().cmp(&rb.slot()))
        });
        let Some((pos, &i)) = best else { break };
        remaining.swap_remove(pos);
        if let Some(c) = counts.get_mut(live[i].zone()) {
            *c -= 1;
        }
        chosen.push(i);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keyalloc_keyspace::{JsonDecoder, KeyLayout, KeySpace, KeyValue, CONSISTENT};

    use super::*;

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: format!("/root/{key}"),
            value: value.as_bytes().to_vec(),
            create_revision: 1,
            mod_revision: 1,
        }
    }

    fn snapshot(kvs: &[KeyValue]) -> Snapshot {
        Snapshot::from_kvs(KeyLayout::new("/root"), 10, kvs, &JsonDecoder).unwrap()
    }

    fn state(zone: &str, id: &str) -> ObservedState {
        let keyspace = Arc::new(KeySpace::new("/root", Arc::new(JsonDecoder)));
        ObservedState::new(keyspace, zone, id)
    }

    fn run(snapshot: &Snapshot, id: &str) -> Proposal {
        propose(snapshot, &state("zone-a", id), &EngineConfig::default()).unwrap()
    }

    fn put(key: &str, value: &[u8]) -> Op {
        Op::Put {
            key: format!("/root/{key}"),
            value: value.to_vec(),
        }
    }

    fn delete(key: &str) -> Op {
        Op::Delete {
            key: format!("/root/{key}"),
        }
    }

    fn replicas(assignments: &[Assignment]) -> Vec<Replica<'_>> {
        assignments
            .iter()
            .map(|assignment| Replica {
                key: "",
                assignment,
                member: None,
            })
            .collect()
    }

    fn assignment(member: &str, slot: u32) -> Assignment {
        Assignment {
            item_id: "i1".to_string(),
            member_zone: "zone-a".to_string(),
            member_id: member.to_string(),
            slot,
            consistent: true,
        }
    }

    #[test]
    fn test_missing_local_member() {
        let snapshot = snapshot(&[kv("members/zone-a/m1", r#"{"R": 1}"#)]);
        let err = propose(&snapshot, &state("zone-a", "m9"), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, AllocatorError::MemberNotFound(key) if key == "/root/members/zone-a/m9"));
    }

    #[test]
    fn test_first_receiver_claims_slot_zero() {
        let snapshot = snapshot(&[
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 2}"#),
            kv("members/zone-a/m2", r#"{"R": 2}"#),
        ]);

        let m1 = run(&snapshot, "m1");
        assert_eq!(m1.txn.ops, vec![put("assignments/i1/zone-a/m1/0", PENDING)]);
        assert_eq!(m1.stats.added, 1);
        assert!(m1.txn.compares.contains(&Compare::PrefixUnchanged {
            prefix: "/root/assignments/i1/".to_string(),
            revision: 10,
        }));
        assert!(m1.txn.compares.contains(&Compare::ModRevision {
            key: "/root/members/zone-a/m1".to_string(),
            revision: 1,
        }));

        // Only one Member claims per Item and round.
        assert!(run(&snapshot, "m2").is_empty());
    }

    #[test]
    fn test_receivers_prefer_most_spare() {
        let snapshot = snapshot(&[
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 5}"#),
        ]);
        assert!(run(&snapshot, "m1").is_empty());
        assert_eq!(run(&snapshot, "m2").stats.added, 1);
    }

    #[test]
    fn test_receivers_spread_across_zones() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("items/i1", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 5}"#),
            kv("members/zone-a/m2", r#"{"R": 9}"#),
            kv("members/zone-b/m3", r#"{"R": 1}"#),
        ]);
        assert!(run(&snapshot, "m2").is_empty());
        let m3 = propose(&snapshot, &state("zone-b", "m3"), &EngineConfig::default()).unwrap();
        assert_eq!(m3.txn.ops, vec![put("assignments/i1/zone-b/m3/1", PENDING)]);
    }

    #[test]
    fn test_flags_own_assignment() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", ""),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
        ]);
        let proposal = run(&snapshot, "m1");
        assert_eq!(
            proposal.txn.ops,
            vec![put("assignments/i1/zone-a/m1/0", CONSISTENT)]
        );
        assert_eq!(proposal.stats.flagged, 1);
    }

    #[test]
    fn test_converged_keyspace_is_idle() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/1", "consistent"),
            kv("items/i1", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        for id in ["m1", "m2"] {
            let proposal = run(&snapshot, id);
            assert!(proposal.is_empty());
            assert!(!proposal.stats.made_progress());
            assert!(!proposal.drained);
        }
    }

    #[test]
    fn test_drain_waits_for_replacement() {
        let draining = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 0}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        assert!(run(&draining, "m1").is_empty());
        assert_eq!(
            run(&draining, "m2").txn.ops,
            vec![put("assignments/i1/zone-a/m2/1", PENDING)]
        );

        // Replacement exists but is unflagged: still not safe.
        let pending = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/1", ""),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 0}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        assert!(run(&pending, "m1").is_empty());
        assert_eq!(run(&pending, "m2").stats.flagged, 1);

        let ready = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/1", "consistent"),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 0}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        let release = run(&ready, "m1");
        assert_eq!(
            release.txn.ops,
            vec![
                delete("assignments/i1/zone-a/m1/0"),
                delete("assignments/i1/zone-a/m2/1"),
                put("assignments/i1/zone-a/m2/0", CONSISTENT),
            ]
        );
        assert_eq!(release.stats.removed, 1);
        assert_eq!(release.stats.packed, 1);
        assert!(!release.drained);
    }

    #[test]
    fn test_drained_member() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m2/0", "consistent"),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 0}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        let proposal = run(&snapshot, "m1");
        assert!(proposal.drained);
        assert!(proposal.is_empty());
    }

    #[test]
    fn test_excess_replica_released() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/1", "consistent"),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        // Highest Slot goes first; nothing to pack behind it.
        assert!(run(&snapshot, "m1").is_empty());
        assert_eq!(
            run(&snapshot, "m2").txn.ops,
            vec![delete("assignments/i1/zone-a/m2/1")]
        );
    }

    #[test]
    fn test_orphan_repaired_by_owner() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-b/gone/1", "consistent"),
            kv("items/i1", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        assert!(run(&snapshot, "m2").is_empty());

        let proposal = run(&snapshot, "m1");
        assert_eq!(
            proposal.txn.ops,
            vec![delete("assignments/i1/zone-b/gone/1")]
        );
        assert_eq!(proposal.stats.repaired, 1);
        assert!(proposal.txn.compares.contains(&Compare::ModRevision {
            key: "/root/members/zone-b/gone".to_string(),
            revision: 0,
        }));
    }

    #[test]
    fn test_removed_item_released_by_holder() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
        ]);
        let proposal = run(&snapshot, "m1");
        assert_eq!(
            proposal.txn.ops,
            vec![delete("assignments/i1/zone-a/m1/0")]
        );
        assert!(proposal.txn.compares.contains(&Compare::ModRevision {
            key: "/root/items/i1".to_string(),
            revision: 0,
        }));
    }

    #[test]
    fn test_removed_item_released_from_top_slot() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/1", "consistent"),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        // Releasing Slot 0 first would leave Slot 1 behind a gap.
        assert!(run(&snapshot, "m1").is_empty());
        assert_eq!(
            run(&snapshot, "m2").txn.ops,
            vec![delete("assignments/i1/zone-a/m2/1")]
        );

        let orphaned = self::snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-b/gone/1", "consistent"),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
        ]);
        let steward = run(&orphaned, "m1");
        assert_eq!(
            steward.txn.ops,
            vec![delete("assignments/i1/zone-b/gone/1")]
        );
        assert_eq!(steward.stats.repaired, 1);
    }

    #[test]
    fn test_under_replicated_item_not_flagged() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", ""),
            kv("items/i1", r#"{"R": 3}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
        ]);
        let proposal = run(&snapshot, "m1");
        assert!(proposal.is_empty());
        assert_eq!(proposal.stats.flagged, 0);
    }

    #[test]
    fn test_first_replica_waits_for_the_rest() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", ""),
            kv("items/i1", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        assert!(run(&snapshot, "m1").is_empty());
        assert_eq!(
            run(&snapshot, "m2").txn.ops,
            vec![put("assignments/i1/zone-a/m2/1", PENDING)]
        );

        let placed = self::snapshot(&[
            kv("assignments/i1/zone-a/m1/0", ""),
            kv("assignments/i1/zone-a/m2/1", ""),
            kv("items/i1", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        assert_eq!(run(&placed, "m1").stats.flagged, 1);
        assert_eq!(run(&placed, "m2").stats.flagged, 1);
    }

    #[test]
    fn test_repair_budget() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", ""),
            kv("assignments/i2/zone-a/m1/0", ""),
            kv("assignments/i3/zone-a/m1/0", ""),
            kv("members/zone-a/m1", r#"{"R": 3}"#),
        ]);
        let config = EngineConfig {
            repair_budget: 2,
            ..EngineConfig::default()
        };
        let proposal = propose(&snapshot, &state("zone-a", "m1"), &config).unwrap();
        assert_eq!(proposal.stats.repaired, 2);
    }

    #[test]
    fn test_op_bound_defers_work() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", ""),
            kv("assignments/i2/zone-a/m1/0", ""),
            kv("assignments/i3/zone-a/m1/0", ""),
            kv("items/i1", r#"{"R": 1}"#),
            kv("items/i2", r#"{"R": 1}"#),
            kv("items/i3", r#"{"R": 1}"#),
            kv("members/zone-a/m1", r#"{"R": 3}"#),
        ]);
        let config = EngineConfig {
            max_txn_ops: 2,
            ..EngineConfig::default()
        };
        let proposal = propose(&snapshot, &state("zone-a", "m1"), &config).unwrap();
        assert_eq!(proposal.txn.ops.len(), 2);
        assert!(proposal.deferred);
    }

    #[test]
    fn test_over_capacity_member_sheds_highest_slot() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i2/zone-a/m1/1", "consistent"),
            kv("assignments/i2/zone-a/m2/0", "consistent"),
            kv("items/i1", r#"{"R": 1}"#),
            kv("items/i2", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
            kv("members/zone-a/m3", r#"{"R": 1}"#),
        ]);
        // m1 sheds its i2 replica; m3 receives it before m1 lets go.
        assert!(run(&snapshot, "m1").is_empty());
        assert_eq!(
            run(&snapshot, "m3").txn.ops,
            vec![put("assignments/i2/zone-a/m3/2", PENDING)]
        );
    }

    #[test]
    fn test_zone_repair_moves_crowded_replica() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/1", "consistent"),
            kv("items/i1", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
            kv("members/zone-b/m3", r#"{"R": 1}"#),
        ]);
        let m3 = propose(&snapshot, &state("zone-b", "m3"), &EngineConfig::default()).unwrap();
        assert_eq!(m3.txn.ops, vec![put("assignments/i1/zone-b/m3/2", PENDING)]);
        assert!(run(&snapshot, "m2").is_empty());
    }

    #[test]
    fn test_gap_packed_by_top_slot_holder() {
        let snapshot = snapshot(&[
            kv("assignments/i1/zone-a/m1/0", "consistent"),
            kv("assignments/i1/zone-a/m2/2", "consistent"),
            kv("items/i1", r#"{"R": 2}"#),
            kv("members/zone-a/m1", r#"{"R": 1}"#),
            kv("members/zone-a/m2", r#"{"R": 1}"#),
        ]);
        assert!(run(&snapshot, "m1").is_empty());
        let m2 = run(&snapshot, "m2");
        assert_eq!(
            m2.txn.ops,
            vec![
                delete("assignments/i1/zone-a/m2/2"),
                put("assignments/i1/zone-a/m2/1", CONSISTENT),
            ]
        );
        assert_eq!(m2.stats.packed, 1);
    }

    #[test]
    fn test_pack_moves() {
        let dense = [assignment("a", 0), assignment("b", 1)];
        assert!(is_dense(&replicas(&dense)));
        assert!(pack_moves(&replicas(&dense)).is_empty());

        let gaps = [assignment("a", 1), assignment("b", 3), assignment("c", 7)];
        let moves: Vec<(String, u32)> = pack_moves(&replicas(&gaps))
            .into_iter()
            .map(|(r, slot)| (r.assignment.member_id.clone(), slot))
            .collect();
        assert_eq!(moves, vec![("c".to_string(), 0), ("b".to_string(), 2)]);

        let collide = [assignment("a", 0), assignment("b", 0)];
        assert!(!is_dense(&replicas(&collide)));
        let moves = pack_moves(&replicas(&collide));
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].1, 1);
    }
}
