use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters shared by a screen and every context created from it.
///
/// Updated with relaxed atomics from both the frontend and backend workers;
/// readers only ever want a point-in-time [`EngineStatsSnapshot`].
#[derive(Debug, Default)]
pub struct EngineStats {
    variant_compiles: AtomicU64,
    variant_hits: AtomicU64,
    variant_misses: AtomicU64,
    blend_compiles: AtomicU64,

    fence_submits: AtomicU64,
    deferred_work_run: AtomicU64,

    scratch_bytes_staged: AtomicU64,
    scratch_grows: AtomicU64,
    scratch_wrap_waits: AtomicU64,

    tile_stores: AtomicU64,
    tile_invalidates: AtomicU64,

    draws_submitted: AtomicU64,
    draws_skipped: AtomicU64,
    client_draw_blocks: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_variant_compiles(&self) {
        self.variant_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_variant_hits(&self) {
        self.variant_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_variant_misses(&self) {
        self.variant_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blend_compiles(&self) {
        self.blend_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fence_submits(&self) {
        self.fence_submits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_deferred_work_run(&self, n: u64) {
        self.deferred_work_run.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_scratch_bytes_staged(&self, n: u64) {
        self.scratch_bytes_staged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_scratch_grows(&self) {
        self.scratch_grows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scratch_wrap_waits(&self) {
        self.scratch_wrap_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tile_stores(&self) {
        self.tile_stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tile_invalidates(&self) {
        self.tile_invalidates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draws_submitted(&self) {
        self.draws_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draws_skipped(&self) {
        self.draws_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_client_draw_blocks(&self) {
        self.client_draw_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            variant_compiles: self.variant_compiles.load(Ordering::Relaxed),
            variant_hits: self.variant_hits.load(Ordering::Relaxed),
            variant_misses: self.variant_misses.load(Ordering::Relaxed),
            blend_compiles: self.blend_compiles.load(Ordering::Relaxed),
            fence_submits: self.fence_submits.load(Ordering::Relaxed),
            deferred_work_run: self.deferred_work_run.load(Ordering::Relaxed),
            scratch_bytes_staged: self.scratch_bytes_staged.load(Ordering::Relaxed),
            scratch_grows: self.scratch_grows.load(Ordering::Relaxed),
            scratch_wrap_waits: self.scratch_wrap_waits.load(Ordering::Relaxed),
            tile_stores: self.tile_stores.load(Ordering::Relaxed),
            tile_invalidates: self.tile_invalidates.load(Ordering::Relaxed),
            draws_submitted: self.draws_submitted.load(Ordering::Relaxed),
            draws_skipped: self.draws_skipped.load(Ordering::Relaxed),
            client_draw_blocks: self.client_draw_blocks.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub variant_compiles: u64,
    pub variant_hits: u64,
    pub variant_misses: u64,
    pub blend_compiles: u64,
    pub fence_submits: u64,
    pub deferred_work_run: u64,
    pub scratch_bytes_staged: u64,
    pub scratch_grows: u64,
    pub scratch_wrap_waits: u64,
    pub tile_stores: u64,
    pub tile_invalidates: u64,
    pub draws_submitted: u64,
    pub draws_skipped: u64,
    pub client_draw_blocks: u64,
}

impl EngineStatsSnapshot {
    pub fn to_json(self) -> String {
        // Hand-built so workers can dump counters without pulling in a serializer.
        format!(
            "{{\"variants\":{{\"compiles\":{},\"hits\":{},\"misses\":{},\"blend_compiles\":{}}},\"fence\":{{\"submits\":{},\"deferred_work_run\":{}}},\"scratch\":{{\"bytes_staged\":{},\"grows\":{},\"wrap_waits\":{}}},\"tiles\":{{\"stores\":{},\"invalidates\":{}}},\"draws\":{{\"submitted\":{},\"skipped\":{},\"client_blocks\":{}}}}}",
            self.variant_compiles,
            self.variant_hits,
            self.variant_misses,
            self.blend_compiles,
            self.fence_submits,
            self.deferred_work_run,
            self.scratch_bytes_staged,
            self.scratch_grows,
            self.scratch_wrap_waits,
            self.tile_stores,
            self.tile_invalidates,
            self.draws_submitted,
            self.draws_skipped,
            self.client_draw_blocks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = EngineStats::new();
        stats.inc_variant_compiles();
        stats.inc_fence_submits();
        stats.inc_fence_submits();
        stats.add_scratch_bytes_staged(96);
        stats.inc_tile_stores();

        let json = stats.to_json();
        assert!(json.contains("\"compiles\":1"));
        assert!(json.contains("\"submits\":2"));
        assert!(json.contains("\"bytes_staged\":96"));
        assert!(json.contains("\"stores\":1"));
        assert!(json.starts_with('{') && json.ends_with('}'));
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let stats = EngineStats::new();
        let before = stats.snapshot();
        stats.inc_draws_submitted();
        assert_eq!(before.draws_submitted, 0);
        assert_eq!(stats.snapshot().draws_submitted, 1);
    }
}
