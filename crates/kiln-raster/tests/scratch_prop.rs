mod common;

use std::sync::Arc;

use kiln_raster::backend::testing::RecordingBackend;
use kiln_raster::backend::Backend;
use kiln_raster::fence::{Fence, FenceLink};
use kiln_raster::ring_arena::RingArena;
use kiln_raster::scratch::{ScratchAllocator, ScratchClass, ScratchRegion, SCRATCH_ALIGNMENT};
use kiln_raster::EngineStats;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Stage(usize),
    Submit,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..=96).prop_map(Op::Stage),
        1 => Just(Op::Submit),
    ]
}

fn payload(seq: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seq * 31 + i) as u8).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn live_regions_never_alias(
        max_draws in 1u32..=4,
        ops in proptest::collection::vec(op(), 1..120),
    ) {
        common::init_tracing();
        let backend = RecordingBackend::inline();
        let ctx = backend.create_context();
        let stats = Arc::new(EngineStats::new());
        let fence = Fence::with_stats(Arc::clone(&stats));
        let link = FenceLink::new(&fence, &backend, ctx);
        let mut scratch = ScratchAllocator::new(max_draws, u64::MAX, Arc::clone(&stats));

        let mut live: Vec<(ScratchRegion, Vec<u8>)> = Vec::new();
        for (seq, op) in ops.into_iter().enumerate() {
            match op {
                Op::Stage(len) => {
                    let data = payload(seq, len);
                    let region = scratch.stage(ScratchClass::Vertex, Some(&data), len, link);
                    prop_assert_eq!(region.offset() % SCRATCH_ALIGNMENT, 0);
                    prop_assert_eq!(region.len(), len as u64);

                    live.retain(|(region, _)| region.retire() > fence.read());
                    for (other, _) in &live {
                        prop_assert!(
                            !region.overlaps(other),
                            "{region:?} overlaps live {other:?}"
                        );
                    }
                    live.push((region, data));
                }
                Op::Submit => {
                    link.submit();
                }
            }

            // Bytes of every region a queued draw could still read are intact.
            for (region, data) in &live {
                prop_assert_eq!(&region.to_vec(), data);
            }
        }
    }

    #[test]
    fn ring_placements_stay_in_bounds(
        capacity in 16u64..512,
        sizes in proptest::collection::vec(1u64..64, 1..64),
    ) {
        let mut arena = RingArena::new(capacity);
        for (i, size) in sizes.into_iter().enumerate() {
            let Some(placement) = arena.placement(size, SCRATCH_ALIGNMENT) else {
                prop_assert!(size > capacity);
                continue;
            };
            prop_assert!(placement.offset + size <= capacity);
            // Every range retires immediately, so nothing ever blocks.
            arena.retire(i as u64);
            prop_assert_eq!(arena.blocking_retire(placement.offset, size), None);
            arena.commit(placement.offset, size, i as u64 + 1);
        }
    }
}
