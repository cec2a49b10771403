//! The opaque graphics RHI this crate runs on top of.
//!
//! Nothing here links a concrete backend: every type is a trait or a plain
//! data descriptor, and the render graph's device/command-list/resource
//! layer is handed in by the caller. This mirrors how `lgn-graphics-api`
//! sits behind the renderer crate in the engine this runtime was ported
//! from — the upload/statistics engines only ever see `DeviceContext`,
//! `Buffer`, `CommandBuffer` through narrow call surfaces, never the
//! backend (Vulkan/D3D12/null) underneath.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

/// Which hardware queue a command list / query belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

/// Where in the pipeline a timestamp is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampStage {
    Top,
    Bottom,
}

bitflags! {
    /// Pipeline-statistics counters this crate ever asks the RHI to collect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipelineStatsMask: u32 {
        const MESH_INVOCATIONS = 0b01;
        const MESH_PRIMITIVES  = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Host-visible, CPU-write / GPU-read (staging/upload pages).
    CpuToGpu,
    /// Host-visible, GPU-write / CPU-read (query readback buffers).
    GpuToCpu,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: u64,
    pub memory_usage: MemoryUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Timestamp,
    PipelineStatistics,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryPoolDesc {
    pub kind: QueryKind,
    pub count: u32,
    pub stats_mask: PipelineStatsMask,
}

/// A mapped host-visible GPU buffer: an upload page, a union-allocation
/// scratch region, or a readback buffer.
pub trait GpuBuffer: fmt::Debug + Send + Sync {
    fn size(&self) -> u64;

    /// Map `size` bytes starting at `offset`. The returned pointer is valid
    /// for writes/reads of exactly that window until `unmap` is called.
    ///
    /// # Safety
    /// Callers must not read or write outside `[offset, offset + size)` and
    /// must call `unmap` before the buffer is used by the GPU again.
    unsafe fn map(&self, offset: u64, size: u64) -> *mut u8;

    /// # Safety
    /// Must be paired with a prior `map` call; no pointer returned by that
    /// `map` may be used after this returns.
    unsafe fn unmap(&self);
}

pub trait GpuTexture: fmt::Debug + Send + Sync {}

/// Base resource kind an `UploadTarget::Pinned` may point at, unifying
/// buffers and textures the way the original RHI's single `Resource` base
/// class did.
pub trait GpuResource: fmt::Debug + Send + Sync {
    fn as_buffer(&self) -> Option<&dyn GpuBuffer> {
        None
    }
    fn as_texture(&self) -> Option<&dyn GpuTexture> {
        None
    }
}

impl<T: GpuBuffer + 'static> GpuResource for T {
    fn as_buffer(&self) -> Option<&dyn GpuBuffer> {
        Some(self)
    }
}

/// A timestamp or pipeline-statistics query pool.
pub trait QueryPool: fmt::Debug + Send + Sync {
    fn count(&self) -> u32;
    fn kind(&self) -> QueryKind;
}

/// The subset of a device the upload/stats engines need: allocating
/// host-visible buffers and query pools, and calibrating GPU timestamps.
pub trait Device: Send + Sync {
    fn create_buffer(&self, desc: BufferDesc) -> Arc<dyn GpuBuffer>;
    fn create_query_pool(&self, desc: QueryPoolDesc) -> Arc<dyn QueryPool>;
    fn timestamp_ticks_per_second(&self, queue: QueueKind) -> u64;
}

/// Describes one subresource's placement inside a staging buffer, handed
/// to `copy_buffer_to_texture` / `copy_texture_to_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyableFootprint {
    pub offset: u64,
    pub row_pitch: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A single recorded command list. Copies execute in recording order.
///
/// Resources are taken by trait-object reference rather than by `&Arc<dyn
/// T>`: callers typically resolve an `UploadTarget` down to an
/// `Arc<dyn GpuResource>` and then narrow it with `as_buffer()`/
/// `as_texture()`, which hands back a `&dyn GpuBuffer`/`&dyn GpuTexture` —
/// there is no safe cast from `Arc<dyn GpuResource>` to `Arc<dyn GpuBuffer>`.
pub trait CommandList {
    fn copy_buffer_region(
        &mut self,
        dst: &dyn GpuBuffer,
        dst_offset: u64,
        src: &dyn GpuBuffer,
        src_offset: u64,
        size: u64,
    );

    fn copy_buffer_to_texture(
        &mut self,
        src: &dyn GpuBuffer,
        dst: &dyn GpuTexture,
        mip: u32,
        slice: u32,
        footprint: CopyableFootprint,
        x: u32,
        y: u32,
        z: u32,
    );

    fn copy_texture_to_buffer(
        &mut self,
        src: &dyn GpuTexture,
        mip: u32,
        slice: u32,
        dst: &dyn GpuBuffer,
        footprint: CopyableFootprint,
    );

    fn write_timestamp(&mut self, pool: &dyn QueryPool, index: u32, stage: TimestampStage);
    fn begin_query(&mut self, pool: &dyn QueryPool, index: u32);
    fn end_query(&mut self, pool: &dyn QueryPool, index: u32);

    fn resolve_query_data(
        &mut self,
        pool: &dyn QueryPool,
        first: u32,
        count: u32,
        dst: &dyn GpuBuffer,
        dst_offset: u64,
    );
}

/// A handle into an external resource registry: key + generation + epoch,
/// per the original `ResourceRegistry::RegistryHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryHandle {
    pub key: u32,
    pub generation: u32,
    pub epoch: u64,
}

/// Resolves registry handles to live resources for the current frame. The
/// epoch installed via `UploadResolveContext` must match the handle's
/// epoch, or resolution fails with `ResourceTypeMismatch`-adjacent
/// "stale epoch" semantics left to the implementor — the render-graph's own
/// registry owns what counts as stale, this trait only forwards to it.
pub trait ResourceRegistry: Send + Sync {
    fn resolve(&self, handle: RegistryHandle) -> Option<Arc<dyn GpuResource>>;
}

/// Byte layout of one resolved `PipelineStatistics` query element: two
/// little-endian `u64` counters, `MeshInvocations` then `MeshPrimitives`,
/// matching `PipelineStatsMask`'s bit order.
pub const PIPELINE_STATS_ELEMENT_SIZE: u64 = 16;
pub const MESH_INVOCATIONS_OFFSET: u64 = 0;
pub const MESH_PRIMITIVES_OFFSET: u64 = 8;

/// In-memory fakes of every RHI trait, used by this crate's own test suite
/// (both the inline `#[cfg(test)]` modules and the `tests/` scenarios).
/// Public and not `cfg(test)`-gated so `tests/*.rs` integration files — which
/// compile as a separate crate — can reach them too.
pub mod test_support {
    use std::cell::UnsafeCell;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{
        BufferDesc, CommandList, CopyableFootprint, Device, GpuBuffer, GpuResource, GpuTexture,
        QueryKind, QueryPool, QueryPoolDesc, QueueKind, TimestampStage, MESH_INVOCATIONS_OFFSET,
        MESH_PRIMITIVES_OFFSET, PIPELINE_STATS_ELEMENT_SIZE,
    };

    /// A host-visible buffer backed by a plain `Vec<u8>`. `map`/`unmap` hand
    /// out raw pointers into that vec, which is sound as long as callers
    /// honor the `GpuBuffer::map` contract (no overlapping maps, no map
    /// spanning a resize) — true of every caller in this crate.
    pub struct FakeBuffer {
        data: UnsafeCell<Vec<u8>>,
    }

    // SAFETY: access is serialized by the single-threaded test harnesses
    // that use this type; nothing here is actually shared across threads.
    unsafe impl Send for FakeBuffer {}
    unsafe impl Sync for FakeBuffer {}

    impl FakeBuffer {
        pub fn new(size: u64) -> Self {
            Self {
                data: UnsafeCell::new(vec![0u8; size as usize]),
            }
        }

        pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
            let data = unsafe { &*self.data.get() };
            data[offset as usize..(offset + len) as usize].to_vec()
        }

        pub fn write(&self, offset: u64, bytes: &[u8]) {
            let data = unsafe { &mut *self.data.get() };
            data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl std::fmt::Debug for FakeBuffer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FakeBuffer").field("size", &self.size()).finish()
        }
    }

    impl GpuBuffer for FakeBuffer {
        fn size(&self) -> u64 {
            unsafe { (*self.data.get()).len() as u64 }
        }

        unsafe fn map(&self, offset: u64, size: u64) -> *mut u8 {
            let data = &mut *self.data.get();
            assert!(offset + size <= data.len() as u64, "map out of bounds");
            data.as_mut_ptr().add(offset as usize)
        }

        unsafe fn unmap(&self) {}
    }

    #[derive(Debug, Default)]
    pub struct FakeTexture;

    impl GpuTexture for FakeTexture {}

    impl GpuResource for FakeTexture {
        fn as_texture(&self) -> Option<&dyn GpuTexture> {
            Some(self)
        }
    }

    #[derive(Debug)]
    pub struct FakeQueryPool {
        kind: QueryKind,
        count: u32,
    }

    impl QueryPool for FakeQueryPool {
        fn count(&self) -> u32 {
            self.count
        }

        fn kind(&self) -> QueryKind {
            self.kind
        }
    }

    /// Resolves every handle to a fixed in-memory resource map; used where
    /// tests exercise `UploadTarget::RegistryHandle` resolution.
    #[derive(Default)]
    pub struct FakeRegistry {
        resources: Mutex<HashMap<super::RegistryHandle, Arc<dyn GpuResource>>>,
    }

    impl FakeRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, handle: super::RegistryHandle, resource: Arc<dyn GpuResource>) {
            self.resources.lock().insert(handle, resource);
        }
    }

    impl super::ResourceRegistry for FakeRegistry {
        fn resolve(&self, handle: super::RegistryHandle) -> Option<Arc<dyn GpuResource>> {
            self.resources.lock().get(&handle).cloned()
        }
    }

    pub struct FakeDevice {
        pub ticks_per_second: u64,
    }

    impl Default for FakeDevice {
        fn default() -> Self {
            Self {
                ticks_per_second: 1_000_000,
            }
        }
    }

    impl Device for FakeDevice {
        fn create_buffer(&self, desc: BufferDesc) -> Arc<dyn GpuBuffer> {
            Arc::new(FakeBuffer::new(desc.size))
        }

        fn create_query_pool(&self, desc: QueryPoolDesc) -> Arc<dyn QueryPool> {
            Arc::new(FakeQueryPool {
                kind: desc.kind,
                count: desc.count,
            })
        }

        fn timestamp_ticks_per_second(&self, _queue: QueueKind) -> u64 {
            self.ticks_per_second
        }
    }

    /// Records and simulates GPU work synchronously: buffer-to-buffer copies
    /// actually move bytes (so destination contents are assertable), query
    /// timestamps advance a monotonic fake clock, and pipeline-statistics
    /// values resolve whatever a test pre-loaded with `set_pipeline_stats`.
    #[derive(Default)]
    pub struct FakeCommandList {
        pub log: Vec<String>,
        clock: u64,
        pub tick_step: u64,
        timestamps: HashMap<u32, u64>,
        pipeline_stats: HashMap<u32, (u64, u64)>,
    }

    impl FakeCommandList {
        pub fn new() -> Self {
            Self {
                tick_step: 1_000,
                ..Default::default()
            }
        }

        pub fn set_pipeline_stats(&mut self, slot: u32, invocations: u64, primitives: u64) {
            self.pipeline_stats.insert(slot, (invocations, primitives));
        }

        pub fn timestamp_value(&self, slot: u32) -> Option<u64> {
            self.timestamps.get(&slot).copied()
        }
    }

    impl CommandList for FakeCommandList {
        fn copy_buffer_region(
            &mut self,
            dst: &dyn GpuBuffer,
            dst_offset: u64,
            src: &dyn GpuBuffer,
            src_offset: u64,
            size: u64,
        ) {
            unsafe {
                let src_ptr = src.map(src_offset, size);
                let bytes = std::slice::from_raw_parts(src_ptr, size as usize).to_vec();
                src.unmap();
                let dst_ptr = dst.map(dst_offset, size);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst_ptr, size as usize);
                dst.unmap();
            }
            self.log.push(format!(
                "copy_buffer_region dst_offset={dst_offset} src_offset={src_offset} size={size}"
            ));
        }

        fn copy_buffer_to_texture(
            &mut self,
            _src: &dyn GpuBuffer,
            _dst: &dyn GpuTexture,
            mip: u32,
            slice: u32,
            footprint: CopyableFootprint,
            x: u32,
            y: u32,
            z: u32,
        ) {
            self.log.push(format!(
                "copy_buffer_to_texture mip={mip} slice={slice} offset={} x={x} y={y} z={z}",
                footprint.offset
            ));
        }

        fn copy_texture_to_buffer(
            &mut self,
            _src: &dyn GpuTexture,
            mip: u32,
            slice: u32,
            _dst: &dyn GpuBuffer,
            footprint: CopyableFootprint,
        ) {
            self.log.push(format!(
                "copy_texture_to_buffer mip={mip} slice={slice} offset={}",
                footprint.offset
            ));
        }

        fn write_timestamp(&mut self, _pool: &dyn QueryPool, index: u32, stage: TimestampStage) {
            self.clock += self.tick_step.max(1);
            self.timestamps.insert(index, self.clock);
            self.log.push(format!("write_timestamp index={index} stage={stage:?}"));
        }

        fn begin_query(&mut self, _pool: &dyn QueryPool, index: u32) {
            self.log.push(format!("begin_query index={index}"));
        }

        fn end_query(&mut self, _pool: &dyn QueryPool, index: u32) {
            self.log.push(format!("end_query index={index}"));
        }

        fn resolve_query_data(
            &mut self,
            pool: &dyn QueryPool,
            first: u32,
            count: u32,
            dst: &dyn GpuBuffer,
            dst_offset: u64,
        ) {
            match pool.kind() {
                QueryKind::Timestamp => {
                    for i in 0..count {
                        let value = self.timestamps.get(&(first + i)).copied().unwrap_or(0);
                        dst.write_u64(dst_offset + u64::from(i) * 8, value);
                    }
                }
                QueryKind::PipelineStatistics => {
                    for i in 0..count {
                        let (invocations, primitives) =
                            self.pipeline_stats.get(&(first + i)).copied().unwrap_or((0, 0));
                        let base = dst_offset + u64::from(i) * PIPELINE_STATS_ELEMENT_SIZE;
                        dst.write_u64(base + MESH_INVOCATIONS_OFFSET, invocations);
                        dst.write_u64(base + MESH_PRIMITIVES_OFFSET, primitives);
                    }
                }
            }
            self.log
                .push(format!("resolve_query_data first={first} count={count}"));
        }
    }

    trait WriteU64 {
        fn write_u64(&self, offset: u64, value: u64);
    }

    impl WriteU64 for dyn GpuBuffer + '_ {
        fn write_u64(&self, offset: u64, value: u64) {
            unsafe {
                let ptr = self.map(offset, 8);
                std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), ptr, 8);
                self.unmap();
            }
        }
    }
}
