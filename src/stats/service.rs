//! The Statistics Service: the external-facing façade over the Query Heap
//! Manager and Stats Aggregator, mirroring the Upload Service's
//! process-wide active-service slot.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Result, UploadStatsError};
use crate::rhi::{CommandList, Device, QueueKind};
use crate::stats::aggregator::StatsAggregator;
use crate::stats::query_heap::QueryHeapManager;
use crate::stats::types::{MemoryBudgetSource, MemoryBudgetStats, PassStats};

pub struct StatisticsService {
    query_heap: QueryHeapManager,
    aggregator: StatsAggregator,
}

impl std::fmt::Debug for StatisticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsService").finish_non_exhaustive()
    }
}

impl StatisticsService {
    pub fn new(device: Arc<dyn Device>, frames_in_flight: usize, collect_pipeline_statistics: bool) -> Self {
        Self {
            query_heap: QueryHeapManager::new(device, frames_in_flight, collect_pipeline_statistics),
            aggregator: StatsAggregator::new(),
        }
    }

    pub fn set_memory_budget_source(&mut self, source: Box<dyn MemoryBudgetSource>) {
        self.aggregator.set_memory_budget_source(source);
    }

    pub fn register_pass(&mut self, name: &str, is_geometry: bool) -> usize {
        self.query_heap.register_pass(name, is_geometry)
    }

    pub fn register_queue(&mut self, queue: QueueKind) {
        self.query_heap.register_queue(queue);
    }

    pub fn setup_query_heap(&mut self) {
        self.query_heap.setup_query_heap();
    }

    pub fn begin_frame(&mut self) {
        self.aggregator.begin_frame();
    }

    pub fn begin_query(&mut self, pass: usize, frame: usize, queue: QueueKind, cmd: &mut dyn CommandList) {
        self.query_heap.begin_query(pass, frame, queue, cmd);
    }

    pub fn end_query(&mut self, pass: usize, frame: usize, queue: QueueKind, cmd: &mut dyn CommandList) {
        self.query_heap.end_query(pass, frame, queue, cmd);
    }

    pub fn resolve_queries(&mut self, frame: usize, queue: QueueKind, cmd: &mut dyn CommandList) {
        self.query_heap.resolve_queries(frame, queue, cmd);
    }

    /// Reads back a resolved frame slot's windows and folds them into the
    /// running EMAs. Callers typically invoke this one frame after
    /// `resolve_queries` for the same `(frame, queue)`, once the GPU has
    /// actually finished writing the readback buffer.
    pub fn on_frame_complete(&mut self, frame: usize, queue: QueueKind) {
        self.aggregator.on_frame_complete(&mut self.query_heap, frame, queue);
    }

    pub fn pass_stats(&self, pass_index: usize) -> PassStats {
        self.aggregator.pass_stats(pass_index)
    }

    pub fn visible_pass_indices(&self, max_stale: u64) -> Vec<usize> {
        self.aggregator.visible_pass_indices(max_stale)
    }

    pub fn memory_budget(&self) -> MemoryBudgetStats {
        self.aggregator.memory_budget()
    }

    pub fn pass_name(&self, pass_index: usize) -> Option<&str> {
        self.query_heap.pass_name(pass_index)
    }

    pub fn clear_all(&mut self) {
        self.aggregator.clear_all();
    }
}

static ACTIVE_STATISTICS_SERVICE: Lazy<Mutex<Option<Arc<Mutex<StatisticsService>>>>> = Lazy::new(|| Mutex::new(None));

pub fn set_active_statistics_service(service: Option<Arc<Mutex<StatisticsService>>>) {
    *ACTIVE_STATISTICS_SERVICE.lock() = service;
}

pub fn active_statistics_service() -> Result<Arc<Mutex<StatisticsService>>> {
    ACTIVE_STATISTICS_SERVICE
        .lock()
        .clone()
        .ok_or(UploadStatsError::ServiceInactive("statistics"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::{FakeCommandList, FakeDevice};

    #[test]
    fn service_slot_is_inactive_until_set() {
        set_active_statistics_service(None);
        assert!(matches!(active_statistics_service().unwrap_err(), UploadStatsError::ServiceInactive("statistics")));
    }

    #[test]
    fn end_to_end_pass_timing_round_trips_through_the_service() {
        let device: Arc<dyn Device> = Arc::new(FakeDevice::default());
        let mut service = StatisticsService::new(device, 1, false);
        service.register_queue(QueueKind::Graphics);
        let pass = service.register_pass("shadow", false);
        service.setup_query_heap();
        service.begin_frame();

        let mut cmd = FakeCommandList::new();
        service.begin_query(pass, 0, QueueKind::Graphics, &mut cmd);
        service.end_query(pass, 0, QueueKind::Graphics, &mut cmd);
        service.resolve_queries(0, QueueKind::Graphics, &mut cmd);
        service.on_frame_complete(0, QueueKind::Graphics);

        assert!(service.pass_stats(pass).ema_time_ms > 0.0);
        assert_eq!(service.visible_pass_indices(u64::MAX), vec![pass]);
    }
}
