use std::sync::atomic::{AtomicU64, Ordering};

/// Session-wide counters, shared between the emulation and render threads.
///
/// Updates are relaxed; a snapshot is a consistent view of each counter but
/// not of the set as a whole.
#[derive(Debug, Default)]
pub struct GfxStats {
    texture_hits: AtomicU64,
    texture_misses: AtomicU64,
    texture_failures: AtomicU64,
    combiner_builds: AtomicU64,
    combiner_fallbacks: AtomicU64,

    commands: AtomicU64,
    unknown_opcodes: AtomicU64,
    dropped_triangles: AtomicU64,
    stack_overflows: AtomicU64,

    draws: AtomicU64,
    skipped_draws: AtomicU64,
    color_reads: AtomicU64,
    frames: AtomicU64,

    pool_waits: AtomicU64,
    decode_errors: AtomicU64,
}

impl GfxStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_texture_hits(&self) {
        self.texture_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_texture_misses(&self) {
        self.texture_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_texture_failures(&self) {
        self.texture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_combiner_builds(&self) {
        self.combiner_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_combiner_fallbacks(&self) {
        self.combiner_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_commands(&self, n: u64) {
        self.commands.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_unknown_opcodes(&self, n: u64) {
        self.unknown_opcodes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_triangles(&self, n: u64) {
        self.dropped_triangles.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_stack_overflows(&self) {
        self.stack_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draws(&self) {
        self.draws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_draws(&self) {
        self.skipped_draws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_color_reads(&self) {
        self.color_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pool_waits(&self, waits: u64) {
        self.pool_waits.store(waits, Ordering::Relaxed);
    }

    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GfxStatsSnapshot {
        GfxStatsSnapshot {
            texture_hits: self.texture_hits.load(Ordering::Relaxed),
            texture_misses: self.texture_misses.load(Ordering::Relaxed),
            texture_failures: self.texture_failures.load(Ordering::Relaxed),
            combiner_builds: self.combiner_builds.load(Ordering::Relaxed),
            combiner_fallbacks: self.combiner_fallbacks.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            unknown_opcodes: self.unknown_opcodes.load(Ordering::Relaxed),
            dropped_triangles: self.dropped_triangles.load(Ordering::Relaxed),
            stack_overflows: self.stack_overflows.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            skipped_draws: self.skipped_draws.load(Ordering::Relaxed),
            color_reads: self.color_reads.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            pool_waits: self.pool_waits.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GfxStatsSnapshot {
    pub texture_hits: u64,
    pub texture_misses: u64,
    pub texture_failures: u64,
    pub combiner_builds: u64,
    pub combiner_fallbacks: u64,

    /// Display list commands interpreted.
    pub commands: u64,
    pub unknown_opcodes: u64,
    /// Triangles rejected by visibility or backface tests.
    pub dropped_triangles: u64,
    pub stack_overflows: u64,

    pub draws: u64,
    /// Draws dropped because no program could be compiled for them.
    pub skipped_draws: u64,
    pub color_reads: u64,
    pub frames: u64,

    /// Producer stalls on a full ring buffer pool.
    pub pool_waits: u64,
    pub decode_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = GfxStats::new();
        stats.inc_texture_hits();
        stats.inc_texture_misses();
        stats.inc_texture_hits();
        stats.add_dropped_triangles(3);
        stats.set_pool_waits(7);
        stats.set_pool_waits(9);

        let snap = stats.snapshot();
        assert_eq!(snap.texture_hits, 2);
        assert_eq!(snap.texture_misses, 1);
        assert_eq!(snap.dropped_triangles, 3);
        assert_eq!(snap.pool_waits, 9);
        assert_eq!(snap.frames, 0);
    }
}
