//! Property tests for chunk map splits and ownership moves.

use docshard_meta::chunk_map::{Chunk, ChunkMap};
use docshard_meta::split::SplitPlanner;
use docshard_meta::types::*;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Split(i64),
    Move(i64, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (-1_000i64..1_000).prop_map(Op::Split),
        1 => ((-1_000i64..1_000), 0usize..3).prop_map(|(k, s)| Op::Move(k, s)),
    ]
}

fn ns() -> Namespace {
    Namespace::new("testDB", "foo")
}

fn shard(i: usize) -> ShardId {
    ShardId::new(format!("shard{:04}", i))
}

fn apply(map: &mut ChunkMap, op: &Op) -> Option<CollectionVersion> {
    let current = map.version();
    match op {
        Op::Split(k) => {
            let point = ShardKeyValue::Int(*k);
            let chunk = map.lookup(&point).ok()?.clone();
            let children = SplitPlanner::plan_split(&chunk, &[point], current.version).ok()?;
            Some(map.apply_delta(current, children).expect("valid split delta"))
        }
        Op::Move(k, s) => {
            let chunk = map.lookup(&ShardKeyValue::Int(*k)).ok()?.clone();
            if chunk.shard == shard(*s) {
                return None;
            }
            let moved = Chunk::new(
                chunk.ns.clone(),
                chunk.range.clone(),
                shard(*s),
                current.version.next_major(),
            );
            Some(map.apply_delta(current, vec![moved]).expect("valid move delta"))
        }
    }
}

proptest! {
    #[test]
    fn prop_splits_and_moves_keep_partition(ops in prop::collection::vec(op(), 1..40)) {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), shard(0));
        let mut last = map.version();
        for op in &ops {
            if let Some(version) = apply(&mut map, op) {
                prop_assert!(version.version > last.version);
                prop_assert_eq!(version.epoch, last.epoch);
                last = version;
            }
            prop_assert!(map.validate().is_ok());
        }
    }

    #[test]
    fn prop_split_children_cover_parent(points in prop::collection::btree_set(-500i64..500, 1..8)) {
        let chunk = Chunk::new(ns(), ChunkRange::full(), shard(0), ChunkVersion::new(1, 0));
        let points: Vec<ShardKeyValue> = points.into_iter().map(ShardKeyValue::Int).collect();
        let children = SplitPlanner::plan_split(&chunk, &points, chunk.version).unwrap();
        prop_assert_eq!(children.len(), points.len() + 1);
        prop_assert_eq!(&children[0].range.min, &ShardKeyValue::MinKey);
        prop_assert_eq!(&children[children.len() - 1].range.max, &ShardKeyValue::MaxKey);
        for pair in children.windows(2) {
            prop_assert_eq!(&pair[0].range.max, &pair[1].range.min);
            prop_assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn prop_lookup_finds_containing_chunk(
        points in prop::collection::btree_set(-500i64..500, 1..8),
        key in -1_000i64..1_000,
    ) {
        let chunk = Chunk::new(ns(), ChunkRange::full(), shard(0), ChunkVersion::new(1, 0));
        let points: Vec<ShardKeyValue> = points.into_iter().map(ShardKeyValue::Int).collect();
        let children = SplitPlanner::plan_split(&chunk, &points, chunk.version).unwrap();
        let map = ChunkMap::from_chunks(ns(), Epoch::generate(), children).unwrap();
        let key = ShardKeyValue::Int(key);
        let found = map.lookup(&key).unwrap();
        prop_assert!(found.range.contains(&key));
    }
}
