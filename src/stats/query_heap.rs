//! The Query Heap Manager: pass registration, query-heap sizing, and
//! per-pass timestamp / pipeline-statistics query recording and resolution.
//!
//! Ported from `StatisticsManager::{RegisterPass, SetupQueryHeap,
//! BeginQuery, EndQuery, ResolveQueries}`
//! (`original_source/src/Managers/Singletons/StatisticsManager.cpp`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::rhi::{
    CommandList, Device, GpuBuffer, BufferDesc, MemoryUsage, PipelineStatsMask, QueryKind,
    QueryPool, QueryPoolDesc, QueueKind, TimestampStage, MESH_INVOCATIONS_OFFSET,
    MESH_PRIMITIVES_OFFSET, PIPELINE_STATS_ELEMENT_SIZE,
};

#[derive(Debug, Clone)]
struct PassInfo {
    name: String,
    is_geometry: bool,
}

/// One registered queue's pools readback state: the readback buffers are
/// (re)allocated every time `setup_query_heap` grows pass capacity.
struct QueueState {
    ticks_per_second: u64,
    timestamp_readback: Arc<dyn GpuBuffer>,
    pipeline_stats_readback: Arc<dyn GpuBuffer>,
    /// Slots written via `begin_query`/`end_query` this frame, per frame
    /// slot, awaiting `resolve_queries`.
    recorded: Vec<Vec<u32>>,
    /// `(first, count)` timestamp ranges resolved this frame, per frame
    /// slot, awaiting `Aggregator::on_frame_complete`.
    pending_timestamp_ranges: Vec<Vec<(u32, u32)>>,
    /// `(pass_index, pipeline_stats_slot)` pairs resolved this frame, per
    /// frame slot.
    pending_pipeline_stats: Vec<Vec<(usize, u32)>>,
}

/// A fully resolved window ready for `Aggregator::on_frame_complete` to read
/// back and fold into the running EMAs.
pub struct ResolvedFrame {
    pub timestamp_ranges: Vec<(u32, u32)>,
    pub pipeline_stats: Vec<(usize, u32)>,
}

pub struct QueryHeapManager {
    device: Arc<dyn Device>,
    frames_in_flight: usize,
    passes: Vec<PassInfo>,
    name_to_index: HashMap<String, usize>,
    unnamed_counter: u32,
    pass_capacity: u32,
    collect_pipeline_statistics: bool,
    timestamp_pool: Option<Arc<dyn QueryPool>>,
    pipeline_stats_pool: Option<Arc<dyn QueryPool>>,
    queues: HashMap<QueueKind, QueueState>,
}

impl QueryHeapManager {
    pub fn new(device: Arc<dyn Device>, frames_in_flight: usize, collect_pipeline_statistics: bool) -> Self {
        Self {
            device,
            frames_in_flight: frames_in_flight.max(1),
            passes: Vec::new(),
            name_to_index: HashMap::new(),
            unnamed_counter: 0,
            pass_capacity: 0,
            collect_pipeline_statistics,
            timestamp_pool: None,
            pipeline_stats_pool: None,
            queues: HashMap::new(),
        }
    }

    /// Registers a pass by name, deduping on an exact name match. A pass
    /// already registered as geometry stays geometry even if a later call
    /// registers the same name with `is_geometry = false` — the promotion is
    /// sticky, per the original's "once geometry, always geometry" comment.
    pub fn register_pass(&mut self, name: &str, is_geometry: bool) -> usize {
        let name = if name.is_empty() {
            self.unnamed_counter += 1;
            format!("UnnamedPass#{}", self.unnamed_counter)
        } else {
            name.to_string()
        };

        if let Some(&index) = self.name_to_index.get(&name) {
            if is_geometry {
                self.passes[index].is_geometry = true;
            }
            return index;
        }

        let index = self.passes.len();
        self.passes.push(PassInfo {
            name: name.clone(),
            is_geometry,
        });
        self.name_to_index.insert(name, index);
        index
    }

    pub fn pass_name(&self, pass_index: usize) -> Option<&str> {
        self.passes.get(pass_index).map(|p| p.name.as_str())
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn is_geometry_pass(&self, pass_index: usize) -> bool {
        self.passes.get(pass_index).map(|p| p.is_geometry).unwrap_or(false)
    }

    pub fn register_queue(&mut self, queue: QueueKind) {
        self.queues.entry(queue).or_insert_with(|| QueueState {
            ticks_per_second: self.device.timestamp_ticks_per_second(queue),
            timestamp_readback: Arc::new(NullBuffer),
            pipeline_stats_readback: Arc::new(NullBuffer),
            recorded: vec![Vec::new(); self.frames_in_flight],
            pending_timestamp_ranges: vec![Vec::new(); self.frames_in_flight],
            pending_pipeline_stats: vec![Vec::new(); self.frames_in_flight],
        });
    }

    pub fn ticks_per_second(&self, queue: QueueKind) -> u64 {
        self.queues.get(&queue).map(|q| q.ticks_per_second).unwrap_or(1)
    }

    /// (Re)allocates the query pools and every registered queue's readback
    /// buffers to fit the current pass count. Pass capacity is the next
    /// power of two and never shrinks, even if passes are later registered
    /// in a different order across frames, so slot indices handed out for
    /// frames still in flight never become invalid mid-flight.
    pub fn setup_query_heap(&mut self) {
        let needed = (self.passes.len().max(1) as u32).next_power_of_two();
        if needed <= self.pass_capacity && self.timestamp_pool.is_some() {
            return;
        }
        self.pass_capacity = self.pass_capacity.max(needed);

        let timestamp_count = 2 * self.pass_capacity * self.frames_in_flight as u32;
        let pipeline_stats_count = self.pass_capacity * self.frames_in_flight as u32;

        self.timestamp_pool = Some(self.device.create_query_pool(QueryPoolDesc {
            kind: QueryKind::Timestamp,
            count: timestamp_count,
            stats_mask: PipelineStatsMask::empty(),
        }));
        self.pipeline_stats_pool = Some(self.device.create_query_pool(QueryPoolDesc {
            kind: QueryKind::PipelineStatistics,
            count: pipeline_stats_count,
            stats_mask: PipelineStatsMask::MESH_INVOCATIONS | PipelineStatsMask::MESH_PRIMITIVES,
        }));

        for state in self.queues.values_mut() {
            state.timestamp_readback = self.device.create_buffer(BufferDesc {
                size: u64::from(timestamp_count) * 8,
                memory_usage: MemoryUsage::GpuToCpu,
            });
            state.pipeline_stats_readback = self.device.create_buffer(BufferDesc {
                size: u64::from(pipeline_stats_count) * PIPELINE_STATS_ELEMENT_SIZE,
                memory_usage: MemoryUsage::GpuToCpu,
            });
        }
    }

    fn timestamp_slot(&self, frame: usize, pass: usize) -> u32 {
        2 * (frame as u32 * self.pass_capacity + pass as u32)
    }

    fn pipeline_stats_slot(&self, frame: usize, pass: usize) -> u32 {
        frame as u32 * self.pass_capacity + pass as u32
    }

    pub fn begin_query(&mut self, pass: usize, frame: usize, queue: QueueKind, cmd: &mut dyn CommandList) {
        let timestamp_pool = self.timestamp_pool.clone().expect("setup_query_heap must run before begin_query");
        let slot = self.timestamp_slot(frame, pass);
        cmd.write_timestamp(timestamp_pool.as_ref(), slot, TimestampStage::Top);

        let is_geometry = self.is_geometry_pass(pass);
        if self.collect_pipeline_statistics && is_geometry {
            let pipeline_stats_pool = self.pipeline_stats_pool.clone().expect("setup_query_heap must run before begin_query");
            let ps_slot = self.pipeline_stats_slot(frame, pass);
            cmd.begin_query(pipeline_stats_pool.as_ref(), ps_slot);
        }

        if let Some(state) = self.queues.get_mut(&queue) {
            state.recorded[frame].push(slot);
        }
    }

    pub fn end_query(&mut self, pass: usize, frame: usize, queue: QueueKind, cmd: &mut dyn CommandList) {
        let timestamp_pool = self.timestamp_pool.clone().expect("setup_query_heap must run before end_query");
        let slot = self.timestamp_slot(frame, pass) + 1;
        cmd.write_timestamp(timestamp_pool.as_ref(), slot, TimestampStage::Bottom);

        let is_geometry = self.is_geometry_pass(pass);
        if self.collect_pipeline_statistics && is_geometry {
            let pipeline_stats_pool = self.pipeline_stats_pool.clone().expect("setup_query_heap must run before end_query");
            let ps_slot = self.pipeline_stats_slot(frame, pass);
            cmd.end_query(pipeline_stats_pool.as_ref(), ps_slot);
        }

        if let Some(state) = self.queues.get_mut(&queue) {
            state.recorded[frame].push(slot);
        }
    }

    /// Collapses this frame's recorded timestamp slots into maximal
    /// contiguous ranges and bulk-resolves each range in one call, then
    /// resolves one pipeline-statistics element per recorded geometry pass
    /// individually. Clears the frame's recorded-slot list afterwards.
    pub fn resolve_queries(&mut self, frame: usize, queue: QueueKind, cmd: &mut dyn CommandList) {
        let timestamp_pool = match &self.timestamp_pool {
            Some(p) => p.clone(),
            None => return,
        };
        let pipeline_stats_pool = self.pipeline_stats_pool.clone();
        let pass_capacity = self.pass_capacity;
        let collect_pipeline_statistics = self.collect_pipeline_statistics;

        let state = match self.queues.get_mut(&queue) {
            Some(s) => s,
            None => return,
        };

        let mut slots = std::mem::take(&mut state.recorded[frame]);
        slots.sort_unstable();

        let mut ranges = Vec::new();
        let mut i = 0;
        while i < slots.len() {
            let first = slots[i];
            let mut count = 1u32;
            while i + (count as usize) < slots.len() && slots[i + count as usize] == first + count {
                count += 1;
            }
            ranges.push((first, count));
            i += count as usize;
        }

        for &(first, count) in &ranges {
            cmd.resolve_query_data(
                timestamp_pool.as_ref(),
                first,
                count,
                state.timestamp_readback.as_ref(),
                u64::from(first) * 8,
            );
        }

        let mut resolved_pipeline_stats = Vec::new();
        if collect_pipeline_statistics {
            if let Some(pipeline_stats_pool) = &pipeline_stats_pool {
                // Begin slots are the even slots; resolve one pipeline-stats
                // element per begin slot whose pass is geometry.
                for &slot in &slots {
                    if slot % 2 != 0 {
                        continue;
                    }
                    let pass = (slot / 2) - frame as u32 * pass_capacity;
                    let pass = pass as usize;
                    if self.passes.get(pass).map(|p| p.is_geometry).unwrap_or(false) {
                        let ps_slot = frame as u32 * pass_capacity + pass as u32;
                        cmd.resolve_query_data(
                            pipeline_stats_pool.as_ref(),
                            ps_slot,
                            1,
                            state.pipeline_stats_readback.as_ref(),
                            ps_slot as u64 * PIPELINE_STATS_ELEMENT_SIZE,
                        );
                        resolved_pipeline_stats.push((pass, ps_slot));
                    }
                }
            }
        }

        state.pending_timestamp_ranges[frame].extend(ranges);
        state.pending_pipeline_stats[frame].extend(resolved_pipeline_stats);
    }

    /// Hands the Stats Aggregator every resolved range/element for this
    /// frame slot and clears the pending lists for it.
    pub fn take_resolved(&mut self, frame: usize, queue: QueueKind) -> Option<ResolvedFrame> {
        let state = self.queues.get_mut(&queue)?;
        Some(ResolvedFrame {
            timestamp_ranges: std::mem::take(&mut state.pending_timestamp_ranges[frame]),
            pipeline_stats: std::mem::take(&mut state.pending_pipeline_stats[frame]),
        })
    }

    pub fn pass_capacity(&self) -> u32 {
        self.pass_capacity
    }

    pub fn read_timestamp_window(&self, queue: QueueKind, first: u32, count: u32) -> Vec<u8> {
        let state = &self.queues[&queue];
        read_bytes(state.timestamp_readback.as_ref(), u64::from(first) * 8, u64::from(count) * 8)
    }

    pub fn read_pipeline_stats_element(&self, queue: QueueKind, slot: u32) -> (u64, u64) {
        let state = &self.queues[&queue];
        let base = u64::from(slot) * PIPELINE_STATS_ELEMENT_SIZE;
        let bytes = read_bytes(state.pipeline_stats_readback.as_ref(), base, PIPELINE_STATS_ELEMENT_SIZE);
        let invocations = u64::from_le_bytes(bytes[MESH_INVOCATIONS_OFFSET as usize..MESH_INVOCATIONS_OFFSET as usize + 8].try_into().unwrap());
        let primitives = u64::from_le_bytes(bytes[MESH_PRIMITIVES_OFFSET as usize..MESH_PRIMITIVES_OFFSET as usize + 8].try_into().unwrap());
        (invocations, primitives)
    }

    pub fn pass_index_for_slot(&self, frame: usize, slot: u32) -> usize {
        (slot / 2) as usize - frame * self.pass_capacity as usize
    }

    /// Overwrites one resolved timestamp slot's raw bytes directly, bypassing
    /// `begin_query`/`end_query`. Only used by the aggregator's tests to
    /// reproduce a malformed (`end < begin`) window, which a real GPU clock
    /// cannot otherwise be made to produce on demand.
    #[cfg(test)]
    pub(crate) fn debug_write_timestamp(&self, queue: QueueKind, slot: u32, value: u64) {
        let state = &self.queues[&queue];
        unsafe {
            let ptr = state.timestamp_readback.map(u64::from(slot) * 8, 8);
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), ptr, 8);
            state.timestamp_readback.unmap();
        }
    }
}

fn read_bytes(buffer: &dyn GpuBuffer, offset: u64, len: u64) -> Vec<u8> {
    unsafe {
        let ptr = buffer.map(offset, len);
        let bytes = std::slice::from_raw_parts(ptr, len as usize).to_vec();
        buffer.unmap();
        bytes
    }
}

/// Placeholder `GpuBuffer` installed for a queue before `setup_query_heap`
/// has run; any real read only ever touches buffers allocated by it.
#[derive(Debug)]
struct NullBuffer;

impl GpuBuffer for NullBuffer {
    fn size(&self) -> u64 {
        0
    }
    unsafe fn map(&self, _offset: u64, _size: u64) -> *mut u8 {
        panic!("NullBuffer mapped before setup_query_heap ran")
    }
    unsafe fn unmap(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::{FakeCommandList, FakeDevice};

    fn manager(frames: usize, collect_pipeline_statistics: bool) -> QueryHeapManager {
        QueryHeapManager::new(Arc::new(FakeDevice::default()), frames, collect_pipeline_statistics)
    }

    #[test]
    fn registering_the_same_name_twice_returns_the_same_index() {
        let mut mgr = manager(2, false);
        let a = mgr.register_pass("shadow", false);
        let b = mgr.register_pass("shadow", false);
        assert_eq!(a, b);
        assert_eq!(mgr.pass_count(), 1);
    }

    #[test]
    fn geometry_promotion_is_sticky() {
        let mut mgr = manager(2, false);
        let idx = mgr.register_pass("gbuffer", false);
        assert!(!mgr.is_geometry_pass(idx));
        mgr.register_pass("gbuffer", true);
        assert!(mgr.is_geometry_pass(idx));
        mgr.register_pass("gbuffer", false);
        assert!(mgr.is_geometry_pass(idx), "geometry flag must not un-promote");
    }

    #[test]
    fn unnamed_passes_get_distinct_counter_names() {
        let mut mgr = manager(2, false);
        let a = mgr.register_pass("", false);
        let b = mgr.register_pass("", false);
        assert_ne!(a, b);
        assert_eq!(mgr.pass_name(a), Some("UnnamedPass#1"));
        assert_eq!(mgr.pass_name(b), Some("UnnamedPass#2"));
    }

    #[test]
    fn pass_capacity_rounds_up_to_a_power_of_two_and_never_shrinks() {
        let mut mgr = manager(2, false);
        mgr.register_queue(QueueKind::Graphics);
        for i in 0..5 {
            mgr.register_pass(&format!("p{i}"), false);
        }
        mgr.setup_query_heap();
        assert_eq!(mgr.pass_capacity(), 8);

        // Simulate a later frame registering fewer passes than before.
        let mut mgr2 = manager(2, false);
        mgr2.register_queue(QueueKind::Graphics);
        for i in 0..5 {
            mgr2.register_pass(&format!("p{i}"), false);
        }
        mgr2.setup_query_heap();
        mgr2.register_pass("one-more", false);
        mgr2.setup_query_heap();
        assert!(mgr2.pass_capacity() >= 8);
    }

    #[test]
    fn begin_end_query_round_trips_through_resolve_into_readback_bytes() {
        let mut mgr = manager(1, false);
        mgr.register_queue(QueueKind::Graphics);
        let pass = mgr.register_pass("opaque", false);
        mgr.setup_query_heap();

        let mut cmd = FakeCommandList::new();
        mgr.begin_query(pass, 0, QueueKind::Graphics, &mut cmd);
        mgr.end_query(pass, 0, QueueKind::Graphics, &mut cmd);
        mgr.resolve_queries(0, QueueKind::Graphics, &mut cmd);

        let resolved = mgr.take_resolved(0, QueueKind::Graphics).unwrap();
        assert_eq!(resolved.timestamp_ranges, vec![(0, 2)]);
        assert!(resolved.pipeline_stats.is_empty());

        let bytes = mgr.read_timestamp_window(QueueKind::Graphics, 0, 2);
        let begin = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let end = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        assert!(end > begin);
    }

    #[test]
    fn geometry_pass_resolves_a_pipeline_stats_element_when_enabled() {
        let mut mgr = manager(1, true);
        mgr.register_queue(QueueKind::Graphics);
        let pass = mgr.register_pass("mesh", true);
        mgr.setup_query_heap();

        let mut cmd = FakeCommandList::new();
        let ps_slot = mgr.pipeline_stats_slot(0, pass);
        cmd.set_pipeline_stats(ps_slot, 42, 99);
        mgr.begin_query(pass, 0, QueueKind::Graphics, &mut cmd);
        mgr.end_query(pass, 0, QueueKind::Graphics, &mut cmd);
        mgr.resolve_queries(0, QueueKind::Graphics, &mut cmd);

        let resolved = mgr.take_resolved(0, QueueKind::Graphics).unwrap();
        assert_eq!(resolved.pipeline_stats, vec![(pass, ps_slot)]);
        assert_eq!(mgr.read_pipeline_stats_element(QueueKind::Graphics, ps_slot), (42, 99));
    }

    #[test]
    fn two_passes_in_the_same_frame_resolve_as_one_contiguous_range() {
        let mut mgr = manager(1, false);
        mgr.register_queue(QueueKind::Graphics);
        let p0 = mgr.register_pass("a", false);
        let p1 = mgr.register_pass("b", false);
        mgr.setup_query_heap();

        let mut cmd = FakeCommandList::new();
        mgr.begin_query(p0, 0, QueueKind::Graphics, &mut cmd);
        mgr.end_query(p0, 0, QueueKind::Graphics, &mut cmd);
        mgr.begin_query(p1, 0, QueueKind::Graphics, &mut cmd);
        mgr.end_query(p1, 0, QueueKind::Graphics, &mut cmd);
        mgr.resolve_queries(0, QueueKind::Graphics, &mut cmd);

        let resolved = mgr.take_resolved(0, QueueKind::Graphics).unwrap();
        assert_eq!(resolved.timestamp_ranges, vec![(0, 4)]);
    }
}
