//! Invariants over randomly shaped small fleets.

use std::sync::Arc;

use keyalloc_keyspace::MemStore;
use keyalloc_testing::invariants::{check_converged, member_loads};
use keyalloc_testing::{Fleet, TestingResult};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Shape {
    /// Zone index and `ItemLimit` per Member.
    members: Vec<(usize, u32)>,
    /// `DesiredReplication` per Item.
    items: Vec<u32>,
    /// Member drained after the first convergence, if any.
    drain: Option<usize>,
}

/// Fleets where every Item fits: each Member can hold every Item and there
/// are more Members than the largest replication factor.
fn shape() -> impl Strategy<Value = Shape> {
    (1usize..8).prop_flat_map(|item_count| {
        (
            prop::collection::vec((0usize..3, item_count as u32..12), 4..7),
            prop::collection::vec(1u32..4, item_count),
            prop::option::of(0usize..4),
        )
            .prop_map(|(members, items, drain)| Shape {
                members,
                items,
                drain,
            })
    })
}

async fn run(shape: &Shape) -> TestingResult<()> {
    let fleet_store = Arc::new(MemStore::new());
    let mut fleet = Fleet::start(fleet_store, "/prop").await?;

    let names: Vec<(String, String)> = shape
        .members
        .iter()
        .enumerate()
        .map(|(i, (zone, _))| (format!("zone-{zone}"), format!("m{i}")))
        .collect();
    for ((zone, id), (_, limit)) in names.iter().zip(&shape.members) {
        fleet.add_members(&[(zone.as_str(), id.as_str())], *limit).await?;
    }
    for (i, r) in shape.items.iter().enumerate() {
        fleet.add_items(&[format!("item-{i}")], *r).await?;
    }

    fleet.run_until_idle(40).await?;
    let snapshot = fleet.sync().await?;
    check_converged(snapshot.as_ref())?;

    if let Some(i) = shape.drain {
        let (zone, id) = &names[i];
        fleet.set_limit(&[(zone.as_str(), id.as_str())], 0).await?;
        fleet.run_until_idle(40).await?;

        let snapshot = fleet.sync().await?;
        check_converged(snapshot.as_ref())?;
        let key = fleet.layout().member_key(zone, id);
        assert_eq!(member_loads(&snapshot).get(&key), Some(&0));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_fleets_converge_and_drain(shape in shape()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(run(&shape));
        prop_assert!(result.is_ok(), "{:?}: {:?}", shape, result.err());
    }
}
