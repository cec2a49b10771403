//! The Upload Recorder: the public entry point for buffer and texture
//! subresource uploads.
//!
//! `upload_data` / `upload_texture_subresources` / `execute_upload_pass`
//! mirror `UploadManager::UploadData` / `UploadManager::UploadTextureSubresources`
//! / `UploadManager::ProcessUploads` + `ExecuteResourceCopies` line-for-line
//! in control flow: chunk-if-too-large, allocate, map, memcpy, unmap,
//! coalesce-or-append. The copy-before-upload ordering at flush mirrors the
//! original's own comment ("copies come before uploads to avoid overwriting
//! data").

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, UploadStatsError};
use crate::rhi::{CommandList, GpuBuffer};
use crate::upload::footprint::{self, Format, SourceSubresource};
use crate::upload::overlap;
use crate::upload::page::RingPager;
use crate::upload::target::{UploadResolveContext, UploadTarget};
use crate::upload::update::{BufferUpdate, CopyRequest, Provenance, TextureUpdate};

/// Whether the opt-in last-write-wins pass runs at flush, in addition to
/// the always-on contiguous-append fast path. Grounded on the original's
/// `//ApplyLastWriteWins(update); // Too slow` comment: disabled by default.
#[derive(Debug, Clone, Copy)]
pub struct UploadRecorderConfig {
    pub last_write_wins_on_flush: bool,
}

impl Default for UploadRecorderConfig {
    fn default() -> Self {
        Self {
            last_write_wins_on_flush: false,
        }
    }
}

pub struct UploadRecorder {
    pager: RingPager,
    config: UploadRecorderConfig,
    buffer_updates: Vec<BufferUpdate>,
    texture_updates: Vec<TextureUpdate>,
    copy_requests: Vec<CopyRequest>,
    resolve_context: UploadResolveContext,
}

impl UploadRecorder {
    pub fn new(pager: RingPager, config: UploadRecorderConfig) -> Self {
        Self {
            pager,
            config,
            buffer_updates: Vec::new(),
            texture_updates: Vec::new(),
            copy_requests: Vec::new(),
            resolve_context: UploadResolveContext::default(),
        }
    }

    pub fn set_upload_resolve_context(&mut self, ctx: UploadResolveContext) {
        self.resolve_context = ctx;
    }

    pub fn queue_resource_copy(&mut self, source: UploadTarget, destination: UploadTarget, size: u64) {
        self.copy_requests.push(CopyRequest {
            source,
            destination,
            size,
        });
    }

    /// Stages a buffer write. Chunks into `page_size`-sized pieces if
    /// `size` exceeds a single page, recursing per chunk.
    pub fn upload_data(&mut self, data: &[u8], target: UploadTarget, dest_offset: u64) -> Result<()> {
        let page_size = self.pager.page_size();
        if data.len() as u64 > page_size {
            let mut written = 0u64;
            while written < data.len() as u64 {
                let chunk_len = page_size.min(data.len() as u64 - written);
                let chunk = &data[written as usize..(written + chunk_len) as usize];
                self.upload_data(chunk, target.clone(), dest_offset + written)?;
                written += chunk_len;
            }
            return Ok(());
        }

        if data.is_empty() {
            return Ok(());
        }

        let alloc = self.pager.allocate(data.len() as u64, 1)?;
        unsafe {
            let ptr = alloc.buffer.map(alloc.offset, data.len() as u64);
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
            alloc.buffer.unmap();
        }

        let update = BufferUpdate {
            destination: target,
            upload_page: alloc.buffer,
            upload_offset: alloc.offset,
            dest_offset,
            size: data.len() as u64,
            active: true,
            provenance: Provenance::capture(),
        };

        self.append_or_coalesce(update);
        Ok(())
    }

    fn append_or_coalesce(&mut self, update: BufferUpdate) {
        if let Some(last) = self.buffer_updates.iter_mut().rev().find(|u| u.active) {
            if last.is_contiguous_append_target(&update) {
                last.size += update.size;
                return;
            }
        }
        self.buffer_updates.push(update);
    }

    /// Runs the opt-in last-write-wins merge over every active buffer
    /// update. No-op unless `config.last_write_wins_on_flush` is set.
    fn apply_last_write_wins_if_configured(&mut self) -> Result<()> {
        if !self.config.last_write_wins_on_flush {
            return Ok(());
        }
        let mut history: Vec<BufferUpdate> = Vec::with_capacity(self.buffer_updates.len());
        for update in self.buffer_updates.drain(..) {
            if !update.active {
                history.push(update);
                continue;
            }
            let merged = overlap::apply_last_write_wins(&mut history, &mut self.pager, update)?;
            history.push(merged);
        }
        self.buffer_updates = history;
        Ok(())
    }

    /// Plans, allocates, and writes a texture upload; records one
    /// `TextureUpdate` per packed subresource. Silently does nothing if
    /// there are no subresources to write (the documented best-effort path
    /// for empty texture input).
    pub fn upload_texture_subresources(
        &mut self,
        target: UploadTarget,
        format: Format,
        base_width: u32,
        base_height: u32,
        depth_or_layers: u32,
        mip_levels: u32,
        array_size: u32,
        subresources: &[SourceSubresource<'_>],
    ) -> Result<()> {
        if subresources.is_empty() {
            return Ok(());
        }

        let plan = footprint::plan_upload(format, base_width, base_height, depth_or_layers, mip_levels, array_size)?;
        if plan.total_bytes == 0 {
            return Ok(());
        }

        let alloc = self.pager.allocate(plan.total_bytes, 512)?;
        footprint::write_subresources(&plan, subresources, alloc.buffer.as_ref(), alloc.offset)?;

        for subresource in &plan.footprints {
            self.texture_updates.push(TextureUpdate {
                target: target.clone(),
                mip: subresource.mip,
                array_slice: subresource.array_slice,
                z_slice: 0,
                copyable_footprint: subresource.to_copyable(alloc.offset),
                upload_page: alloc.buffer.clone(),
                provenance: Provenance::capture(),
            });
        }
        Ok(())
    }

    /// The Upload Pass: drains copy requests, then buffer updates, then
    /// texture updates, in that order, onto `cmd`. Clears all three queues.
    pub fn execute_upload_pass(&mut self, cmd: &mut dyn CommandList) -> Result<()> {
        self.apply_last_write_wins_if_configured()?;

        for request in self.copy_requests.drain(..) {
            let source = request
                .source
                .resolve(&self.resolve_context)
                .ok_or(UploadStatsError::NotMaterialized)?;
            let destination = request
                .destination
                .resolve(&self.resolve_context)
                .ok_or(UploadStatsError::NotMaterialized)?;
            let src_buf = source.as_buffer().ok_or(UploadStatsError::ResourceTypeMismatch)?;
            let dst_buf = destination.as_buffer().ok_or(UploadStatsError::ResourceTypeMismatch)?;
            cmd.copy_buffer_region(dst_buf, 0, src_buf, 0, request.size);
        }

        for update in self.buffer_updates.drain(..) {
            if !update.active {
                continue;
            }
            let destination = update
                .destination
                .resolve(&self.resolve_context)
                .ok_or(UploadStatsError::NotMaterialized)?;
            let dst_buf = destination.as_buffer().ok_or(UploadStatsError::ResourceTypeMismatch)?;
            if update.dest_offset + update.size > dst_buf.size() {
                return Err(UploadStatsError::OutOfBounds {
                    offset: update.dest_offset,
                    size: update.size,
                    limit: dst_buf.size(),
                });
            }
            cmd.copy_buffer_region(dst_buf, update.dest_offset, update.upload_page.as_ref(), update.upload_offset, update.size);
        }

        for update in self.texture_updates.drain(..) {
            let destination = update
                .target
                .resolve(&self.resolve_context)
                .ok_or(UploadStatsError::NotMaterialized)?;
            let dst_tex = destination.as_texture().ok_or(UploadStatsError::ResourceTypeMismatch)?;
            cmd.copy_buffer_to_texture(
                update.upload_page.as_ref(),
                dst_tex,
                update.mip,
                update.array_slice,
                update.copyable_footprint,
                0,
                0,
                update.z_slice,
            );
        }

        debug!("upload pass executed");
        Ok(())
    }

    pub fn process_deferred_releases(&mut self, frame_slot: usize) {
        self.pager.retire(frame_slot);
    }

    pub fn pager(&self) -> &RingPager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut RingPager {
        &mut self.pager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::{FakeBuffer, FakeCommandList, FakeDevice};
    use crate::rhi::Device;

    fn recorder() -> UploadRecorder {
        let device: Arc<dyn Device> = Arc::new(FakeDevice::default());
        let pager = RingPager::new(device, 1, 4096).unwrap();
        UploadRecorder::new(pager, UploadRecorderConfig::default())
    }

    fn target(size: u64) -> (UploadTarget, Arc<FakeBuffer>) {
        let buf = Arc::new(FakeBuffer::new(size));
        (UploadTarget::from_shared(buf.clone()), buf)
    }

    #[test]
    fn contiguous_writes_coalesce_into_one_deferred_copy() {
        let mut rec = recorder();
        let (dest, dest_buf) = target(128);

        rec.upload_data(&[b'A'; 64], dest.clone(), 0).unwrap();
        rec.upload_data(&[b'B'; 64], dest.clone(), 64).unwrap();

        assert_eq!(rec.buffer_updates.len(), 1);
        assert_eq!(rec.buffer_updates[0].size, 128);
        assert_eq!(rec.buffer_updates[0].dest_offset, 0);

        let mut cmd = FakeCommandList::new();
        rec.execute_upload_pass(&mut cmd).unwrap();
        assert_eq!(cmd.log.len(), 1);

        let bytes = dest_buf.read(0, 128);
        assert_eq!(&bytes[0..64], &[b'A'; 64]);
        assert_eq!(&bytes[64..128], &[b'B'; 64]);
    }

    #[test]
    fn non_contiguous_write_breaks_the_coalescing_chain() {
        let mut rec = recorder();
        let (dest, _) = target(256);

        rec.upload_data(&[b'A'; 32], dest.clone(), 0).unwrap();
        rec.upload_data(&[b'B'; 32], dest.clone(), 64).unwrap();

        assert_eq!(rec.buffer_updates.len(), 2);
    }

    #[test]
    fn empty_write_is_a_silent_no_op() {
        let mut rec = recorder();
        let (dest, _) = target(16);
        rec.upload_data(&[], dest, 0).unwrap();
        assert!(rec.buffer_updates.is_empty());
    }

    #[test]
    fn large_write_is_chunked_across_pages() {
        let mut rec = recorder();
        let (dest, dest_buf) = target(10_000);
        let data = vec![7u8; 9000];

        rec.upload_data(&data, dest, 0).unwrap();
        assert!(rec.buffer_updates.len() >= 3);

        let mut cmd = FakeCommandList::new();
        rec.execute_upload_pass(&mut cmd).unwrap();
        assert_eq!(dest_buf.read(0, 9000), data);
    }

    #[test]
    fn copy_requests_are_drained_before_buffer_updates() {
        let mut rec = recorder();
        let (src, src_buf) = target(16);
        let (dest, dest_buf) = target(16);
        src_buf.write(0, &[9u8; 16]);

        rec.queue_resource_copy(src, dest.clone(), 16);
        rec.upload_data(&[1u8; 16], dest, 0).unwrap();

        let mut cmd = FakeCommandList::new();
        rec.execute_upload_pass(&mut cmd).unwrap();
        assert!(cmd.log[0].starts_with("copy_buffer_region"));
        assert_eq!(dest_buf.read(0, 16), vec![1u8; 16]);
    }

    #[test]
    fn destination_too_small_for_a_staged_write_fails_at_flush() {
        let mut rec = recorder();
        let tiny = Arc::new(FakeBuffer::new(4));
        rec.upload_data(&[1u8; 8], UploadTarget::from_shared(tiny), 0).unwrap();

        let mut cmd = FakeCommandList::new();
        let err = rec.execute_upload_pass(&mut cmd).unwrap_err();
        assert!(matches!(err, UploadStatsError::OutOfBounds { .. }));
    }
}
