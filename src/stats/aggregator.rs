//! The Stats Aggregator: folds resolved query windows into per-pass EMAs
//! and tracks which passes are currently "visible" (recently updated).
//!
//! Ported from `StatisticsManager::{OnFrameComplete, RebuildVisiblePassIndices,
//! BeginFrame}`.

use crate::rhi::QueueKind;
use crate::stats::query_heap::QueryHeapManager;
use crate::stats::types::{ema_update, MemoryBudgetSource, MemoryBudgetStats, PassStats, NEVER_SEEN_FRAME};

pub struct StatsAggregator {
    passes: Vec<PassStats>,
    frame_serial: u64,
    memory_budget: MemoryBudgetStats,
    budget_source: Option<Box<dyn MemoryBudgetSource>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            frame_serial: 0,
            memory_budget: MemoryBudgetStats::default(),
            budget_source: None,
        }
    }

    pub fn set_memory_budget_source(&mut self, source: Box<dyn MemoryBudgetSource>) {
        self.budget_source = Some(source);
    }

    fn ensure_len(&mut self, pass_count: usize) {
        if self.passes.len() < pass_count {
            self.passes.resize(pass_count, PassStats::default());
        }
    }

    /// Advances the frame serial and samples the memory budget source, if
    /// one is installed. The original samples the allocator's budget once
    /// per frame regardless of whether any pass statistics changed.
    pub fn begin_frame(&mut self) {
        self.frame_serial += 1;
        if let Some(source) = &self.budget_source {
            if let Some((usage_bytes, budget_bytes)) = source.sample() {
                self.memory_budget = MemoryBudgetStats {
                    usage_bytes,
                    budget_bytes,
                    sample_frame_serial: self.frame_serial,
                    valid: true,
                };
            }
        }
    }

    pub fn memory_budget(&self) -> MemoryBudgetStats {
        self.memory_budget
    }

    pub fn frame_serial(&self) -> u64 {
        self.frame_serial
    }

    /// Reads back one frame's resolved timestamp/pipeline-stats windows from
    /// the query heap and folds them into the running EMAs. Malformed
    /// timestamp pairs (`end < begin`, an out-of-order GPU clock or a
    /// half-written window) are silently skipped — everywhere else in this
    /// crate errors are surfaced, but there is no caller to surface this one
    /// to, and a single bad frame of timing data isn't worth failing over.
    pub fn on_frame_complete(&mut self, query_heap: &mut QueryHeapManager, frame: usize, queue: QueueKind) {
        let resolved = match query_heap.take_resolved(frame, queue) {
            Some(r) => r,
            None => return,
        };

        for (first, count) in resolved.timestamp_ranges {
            let bytes = query_heap.read_timestamp_window(queue, first, count);
            let mut i = 0u32;
            while i + 1 < count {
                let base = (i * 8) as usize;
                let begin = u64::from_le_bytes(bytes[base..base + 8].try_into().unwrap());
                let end = u64::from_le_bytes(bytes[base + 8..base + 16].try_into().unwrap());
                if end >= begin {
                    let slot = first + i;
                    let pass = query_heap.pass_index_for_slot(frame, slot);
                    self.ensure_len(pass + 1);
                    let ticks_per_second = query_heap.ticks_per_second(queue).max(1);
                    let ms = (end - begin) as f64 * 1000.0 / ticks_per_second as f64;
                    let stats = &mut self.passes[pass];
                    stats.ema_time_ms = ema_update(stats.ema_time_ms, ms);
                    stats.last_seen_frame_serial = self.frame_serial;
                }
                i += 2;
            }
        }

        for (pass, slot) in resolved.pipeline_stats {
            let (invocations, primitives) = query_heap.read_pipeline_stats_element(queue, slot);
            self.ensure_len(pass + 1);
            let stats = &mut self.passes[pass];
            stats.ema_mesh_invocations = ema_update(stats.ema_mesh_invocations, invocations as f64);
            stats.ema_mesh_primitives = ema_update(stats.ema_mesh_primitives, primitives as f64);
            stats.last_seen_frame_serial = self.frame_serial;
        }
    }

    pub fn pass_stats(&self, pass_index: usize) -> PassStats {
        self.passes.get(pass_index).copied().unwrap_or_default()
    }

    /// Indices of passes considered "visible": last updated within
    /// `max_stale` frames of the current frame serial. `max_stale ==
    /// u64::MAX` additionally includes passes that have never been updated
    /// at all (the "show everything, even placeholders" sentinel mode);
    /// any other `max_stale` excludes never-seen passes outright.
    pub fn visible_pass_indices(&self, max_stale: u64) -> Vec<usize> {
        self.passes
            .iter()
            .enumerate()
            .filter(|(_, stats)| {
                if stats.last_seen_frame_serial == NEVER_SEEN_FRAME {
                    return max_stale == NEVER_SEEN_FRAME;
                }
                self.frame_serial.saturating_sub(stats.last_seen_frame_serial) <= max_stale
            })
            .map(|(index, _)| index)
            .collect()
    }

    pub fn clear_all(&mut self) {
        self.passes.clear();
        self.frame_serial = 0;
        self.memory_budget = MemoryBudgetStats::default();
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::{FakeCommandList, FakeDevice};
    use crate::stats::query_heap::QueryHeapManager;
    use std::sync::Arc;

    fn setup(collect_pipeline_statistics: bool) -> (QueryHeapManager, StatsAggregator) {
        let mut heap = QueryHeapManager::new(Arc::new(FakeDevice::default()), 1, collect_pipeline_statistics);
        heap.register_queue(QueueKind::Graphics);
        (heap, StatsAggregator::new())
    }

    #[test]
    fn timed_pass_updates_its_ema_and_last_seen_serial() {
        let (mut heap, mut agg) = setup(false);
        let pass = heap.register_pass("opaque", false);
        heap.setup_query_heap();

        let mut cmd = FakeCommandList::new();
        heap.begin_query(pass, 0, QueueKind::Graphics, &mut cmd);
        heap.end_query(pass, 0, QueueKind::Graphics, &mut cmd);
        heap.resolve_queries(0, QueueKind::Graphics, &mut cmd);

        agg.begin_frame();
        agg.on_frame_complete(&mut heap, 0, QueueKind::Graphics);

        let stats = agg.pass_stats(pass);
        assert!(stats.ema_time_ms > 0.0);
        assert_eq!(stats.last_seen_frame_serial, 1);
    }

    #[test]
    fn malformed_slot_pair_is_silently_skipped() {
        let (mut heap, mut agg) = setup(false);
        let pass = heap.register_pass("broken", false);
        heap.setup_query_heap();

        let mut cmd = FakeCommandList::new();
        heap.begin_query(pass, 0, QueueKind::Graphics, &mut cmd);
        heap.end_query(pass, 0, QueueKind::Graphics, &mut cmd);
        heap.resolve_queries(0, QueueKind::Graphics, &mut cmd);

        // Corrupt the resolved window so end < begin, which a real GPU
        // clock going backwards could produce.
        heap.debug_write_timestamp(QueueKind::Graphics, 0, 500);
        heap.debug_write_timestamp(QueueKind::Graphics, 1, 100);

        agg.begin_frame();
        agg.on_frame_complete(&mut heap, 0, QueueKind::Graphics);

        assert_eq!(agg.pass_stats(pass), PassStats::default(), "malformed pair must not update the pass's stats");
    }

    #[test]
    fn visible_pass_indices_excludes_stale_and_never_seen_by_default() {
        let mut agg = StatsAggregator::new();
        agg.passes = vec![
            PassStats {
                last_seen_frame_serial: 10,
                ..Default::default()
            },
            PassStats::default(),
        ];
        agg.frame_serial = 11;
        assert_eq!(agg.visible_pass_indices(2), vec![0]);
    }

    #[test]
    fn max_stale_sentinel_includes_never_seen_passes() {
        let mut agg = StatsAggregator::new();
        agg.passes = vec![PassStats::default()];
        agg.frame_serial = 5;
        assert_eq!(agg.visible_pass_indices(NEVER_SEEN_FRAME), vec![0]);
        assert_eq!(agg.visible_pass_indices(5), Vec::<usize>::new());
    }

    #[test]
    fn memory_budget_is_sampled_every_begin_frame() {
        struct FixedSource;
        impl MemoryBudgetSource for FixedSource {
            fn sample(&self) -> Option<(u64, u64)> {
                Some((512, 1024))
            }
        }
        let mut agg = StatsAggregator::new();
        agg.set_memory_budget_source(Box::new(FixedSource));
        agg.begin_frame();
        let budget = agg.memory_budget();
        assert!(budget.valid);
        assert_eq!(budget.usage_bytes, 512);
        assert_eq!(budget.sample_frame_serial, 1);
    }

    #[test]
    fn clear_all_resets_passes_and_frame_serial() {
        let mut agg = StatsAggregator::new();
        agg.passes = vec![PassStats::default()];
        agg.frame_serial = 7;
        agg.clear_all();
        assert_eq!(agg.frame_serial(), 0);
        assert_eq!(agg.pass_stats(0), PassStats::default());
    }
}
