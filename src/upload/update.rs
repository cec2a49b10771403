//! Deferred record types the Upload Recorder accumulates between Upload
//! Pass executions. Ported from `UploadManager::ResourceUpdate` /
//! `UploadManager::TextureUpdate`; the debug-only stacktrace field those
//! carried under `BUILD_TYPE_DEBUG` becomes `Provenance`, captured via
//! `#[track_caller]` at the call site instead of a macro.
#[cfg(debug_assertions)]
use std::panic::Location;
use std::sync::Arc;

use crate::rhi::{CopyableFootprint, GpuBuffer};
use crate::upload::target::UploadTarget;

/// Call-site identity for a staged write, kept only in debug builds. Stands
/// in for the original's `__FILE__`/`__LINE__` capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub file: &'static str,
    pub line: u32,
}

impl Provenance {
    #[cfg(debug_assertions)]
    #[track_caller]
    pub fn capture() -> Option<Self> {
        let loc = Location::caller();
        Some(Self {
            file: loc.file(),
            line: loc.line(),
        })
    }

    #[cfg(not(debug_assertions))]
    pub fn capture() -> Option<Self> {
        None
    }
}

/// One staged buffer write, either still pending (`active`) or absorbed into
/// a later coalesced/overlap-resolved record.
#[derive(Clone)]
pub struct BufferUpdate {
    pub destination: UploadTarget,
    pub upload_page: Arc<dyn GpuBuffer>,
    pub upload_offset: u64,
    pub dest_offset: u64,
    pub size: u64,
    pub active: bool,
    pub provenance: Option<Provenance>,
}

impl BufferUpdate {
    /// True if `self` (as the existing record) is immediately contiguous
    /// with `next` on both the destination and the staging side and shares
    /// the same upload page — the fast-path coalescing condition in
    /// `UploadRecorder::upload_data`.
    pub fn is_contiguous_append_target(&self, next: &BufferUpdate) -> bool {
        self.active
            && self.destination == next.destination
            && self.dest_offset + self.size == next.dest_offset
            && self.upload_offset + self.size == next.upload_offset
            && Arc::ptr_eq(&self.upload_page, &next.upload_page)
    }

    pub fn dest_range(&self) -> (u64, u64) {
        (self.dest_offset, self.dest_offset + self.size)
    }
}

impl std::fmt::Debug for BufferUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferUpdate")
            .field("destination", &self.destination)
            .field("upload_offset", &self.upload_offset)
            .field("dest_offset", &self.dest_offset)
            .field("size", &self.size)
            .field("active", &self.active)
            .finish()
    }
}

/// One subresource of a staged texture upload.
#[derive(Clone)]
pub struct TextureUpdate {
    pub target: UploadTarget,
    pub mip: u32,
    pub array_slice: u32,
    pub z_slice: u32,
    pub copyable_footprint: CopyableFootprint,
    pub upload_page: Arc<dyn GpuBuffer>,
    pub provenance: Option<Provenance>,
}

impl std::fmt::Debug for TextureUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureUpdate")
            .field("target", &self.target)
            .field("mip", &self.mip)
            .field("array_slice", &self.array_slice)
            .field("z_slice", &self.z_slice)
            .field("copyable_footprint", &self.copyable_footprint)
            .finish()
    }
}

/// A direct copy queued by the client for execution at the Upload Pass,
/// ahead of any `BufferUpdate`/`TextureUpdate` so uploads cannot clobber it.
#[derive(Clone, Debug)]
pub struct CopyRequest {
    pub source: UploadTarget,
    pub destination: UploadTarget,
    pub size: u64,
}
