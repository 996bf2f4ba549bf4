mod common;

use std::sync::Arc;

use kiln_raster::{EngineConfig, EngineStats, PassthroughCompiler};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn byte_equal_keys_share_one_compile(index in 0usize..512, a in any::<u8>(), b in any::<u8>()) {
        let (_backend, screen) = common::recording_screen(EngineConfig::default());
        let compiler = PassthroughCompiler::new();
        let stats = EngineStats::new();
        let shader = screen.create_shader(common::vertex_shader("prop-vs"));

        let first = common::vs_key_with_byte(index, a);
        let second = common::vs_key_with_byte(index, b);

        let entry = shader.get_or_compile(&first, &compiler, &stats);
        let again = shader.get_or_compile(&first, &compiler, &stats);
        prop_assert!(entry.same_as(&again));
        prop_assert_eq!(compiler.compile_count(), 1);

        let other = shader.get_or_compile(&second, &compiler, &stats);
        if a == b {
            prop_assert!(entry.same_as(&other));
            prop_assert_eq!(compiler.compile_count(), 1);
        } else {
            prop_assert!(!entry.same_as(&other));
            prop_assert_eq!(compiler.compile_count(), 2);
        }

        let snapshot = stats.snapshot();
        prop_assert_eq!(snapshot.variant_compiles, compiler.compile_count());
        prop_assert_eq!(snapshot.variant_hits + snapshot.variant_misses, 3);
    }
}

#[test]
fn concurrent_lookups_compile_once() {
    let (_backend, screen) = common::recording_screen(EngineConfig::default());
    let compiler = Arc::new(PassthroughCompiler::new());
    let stats = Arc::new(EngineStats::new());
    let shader = screen.create_shader(common::vertex_shader("shared-vs"));
    let key = common::vs_key_with_byte(0, 7);

    let entries: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (shader, compiler, stats) = (&shader, &compiler, &stats);
                scope.spawn(move || shader.get_or_compile(&key, &**compiler, stats))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(compiler.compile_count(), 1);
    assert!(entries.windows(2).all(|pair| pair[0].same_as(&pair[1])));
    assert_eq!(shader.variant_count(), 1);
    assert_eq!(stats.snapshot().variant_hits, 7);
}
