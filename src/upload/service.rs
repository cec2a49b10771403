//! The Upload Service and Upload Policy Service: the external-facing
//! façades over the Upload Recorder and Buffer Upload Policy.
//!
//! Preserves the original's "single active service slot" dispatch pattern
//! (`UploadServiceSlot()` / `UploadPolicyServiceSlot()`) as a
//! `parking_lot::Mutex`-guarded `once_cell::sync::Lazy` static rather than a
//! bare global, per the re-architecture note in DESIGN.md. The upload
//! policy service's snapshot-then-call pattern for `begin_frame`/`flush_all`
//! is this crate's own synthesis of the original's 2.3KB header contract —
//! no implementation source for it survived retrieval.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Result, UploadStatsError};
use crate::rhi::{CommandList, Device};
use crate::upload::footprint::{Format, SourceSubresource};
use crate::upload::page::RingPager;
use crate::upload::policy::{BufferUploadPolicyState, BufferUploadPolicyStats, UploadPolicyTag};
use crate::upload::recorder::{UploadRecorder, UploadRecorderConfig};
use crate::upload::target::{UploadResolveContext, UploadTarget};

/// Owns the page ring and deferred update queues for one render graph
/// instance. All recording for a given frame happens from a single thread,
/// so no internal locking is needed beyond what the process-wide slot below
/// requires.
pub struct UploadService {
    recorder: UploadRecorder,
}

impl std::fmt::Debug for UploadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService").finish_non_exhaustive()
    }
}

impl UploadService {
    pub fn new(device: Arc<dyn Device>, frames_in_flight: usize, page_size: u64, config: UploadRecorderConfig) -> Result<Self> {
        let pager = RingPager::new(device, frames_in_flight, page_size)?;
        Ok(Self {
            recorder: UploadRecorder::new(pager, config),
        })
    }

    pub fn upload_data(&mut self, data: &[u8], target: UploadTarget, dest_offset: u64) -> Result<()> {
        self.recorder.upload_data(data, target, dest_offset)
    }

    #[allow(clippy::too_many_arguments)]
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
        self.recorder.upload_texture_subresources(target, format, base_width, base_height, depth_or_layers, mip_levels, array_size, subresources)
    }

    pub fn queue_resource_copy(&mut self, source: UploadTarget, destination: UploadTarget, size: u64) {
        self.recorder.queue_resource_copy(source, destination, size);
    }

    pub fn process_deferred_releases(&mut self, frame_slot: usize) {
        self.recorder.process_deferred_releases(frame_slot);
    }

    pub fn set_upload_resolve_context(&mut self, ctx: UploadResolveContext) {
        self.recorder.set_upload_resolve_context(ctx);
    }

    /// Executes the Upload Pass: the original's `GetUploadPass()` returned
    /// an opaque render-graph pass object; the render-pass framework that
    /// would schedule it is out of scope here, so this runs it directly.
    pub fn execute_upload_pass(&mut self, cmd: &mut dyn CommandList) -> Result<()> {
        self.recorder.execute_upload_pass(cmd)
    }

    pub fn recorder_mut(&mut self) -> &mut UploadRecorder {
        &mut self.recorder
    }
}

static ACTIVE_UPLOAD_SERVICE: Lazy<Mutex<Option<Arc<Mutex<UploadService>>>>> = Lazy::new(|| Mutex::new(None));

pub fn set_active_upload_service(service: Option<Arc<Mutex<UploadService>>>) {
    *ACTIVE_UPLOAD_SERVICE.lock() = service;
}

pub fn active_upload_service() -> Result<Arc<Mutex<UploadService>>> {
    ACTIVE_UPLOAD_SERVICE
        .lock()
        .clone()
        .ok_or(UploadStatsError::ServiceInactive("upload"))
}

/// A buffer-policy-owning participant the Upload Policy Service drives
/// through `begin_frame`/`flush_all` every frame.
pub trait UploadPolicyClient: Send + Sync {
    fn begin_frame(&self);
    fn flush(&self, upload: &mut UploadService) -> Result<()>;
}

/// One buffer's policy state plus the destination it flushes to — the most
/// common `UploadPolicyClient` implementation, covering the single-buffer
/// case directly without requiring callers to hand-roll the trait.
pub struct SingleBufferPolicyClient {
    state: Mutex<BufferUploadPolicyState>,
    target: UploadTarget,
}

impl SingleBufferPolicyClient {
    pub fn new(tag: UploadPolicyTag, current_size: u64, target: UploadTarget) -> Arc<Self> {
        let mut state = BufferUploadPolicyState::new();
        state.set_policy(tag, current_size);
        Arc::new(Self {
            state: Mutex::new(state),
            target,
        })
    }

    pub fn stage_write(&self, data: &[u8], offset: u64) -> Result<bool> {
        self.state.lock().stage_write(data, offset)
    }

    pub fn set_policy(&self, tag: UploadPolicyTag, current_size: u64) {
        self.state.lock().set_policy(tag, current_size);
    }

    pub fn last_flush_stats(&self) -> BufferUploadPolicyStats {
        self.state.lock().get_last_flush_stats()
    }
}

impl UploadPolicyClient for SingleBufferPolicyClient {
    fn begin_frame(&self) {
        self.state.lock().begin_frame();
    }

    fn flush(&self, upload: &mut UploadService) -> Result<()> {
        self.state.lock().flush_to_upload_service(self.target.clone(), upload.recorder_mut()).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadPolicyServiceStats {
    pub begin_frame_calls: u64,
    pub flush_calls: u64,
    pub registered_clients: usize,
}

/// Holds a set of clients under a mutex; `begin_frame`/`flush_all` snapshot
/// the set under the lock, then invoke callbacks with it released, to avoid
/// re-entrancy deadlocks if a client registers/unregisters from its own
/// callback.
#[derive(Default)]
pub struct UploadPolicyService {
    clients: Mutex<Vec<Arc<dyn UploadPolicyClient>>>,
    begin_frame_calls: std::sync::atomic::AtomicU64,
    flush_calls: std::sync::atomic::AtomicU64,
}

impl UploadPolicyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&self, client: Arc<dyn UploadPolicyClient>) {
        self.clients.lock().push(client);
    }

    pub fn unregister_client(&self, client: &Arc<dyn UploadPolicyClient>) {
        self.clients.lock().retain(|c| !Arc::ptr_eq(c, client));
    }

    pub fn begin_frame(&self) {
        let snapshot: Vec<_> = self.clients.lock().clone();
        for client in &snapshot {
            client.begin_frame();
        }
        self.begin_frame_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn flush_all(&self, upload: &mut UploadService) -> Result<()> {
        let snapshot: Vec<_> = self.clients.lock().clone();
        for client in &snapshot {
            client.flush(upload)?;
        }
        self.flush_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub fn get_stats(&self) -> UploadPolicyServiceStats {
        UploadPolicyServiceStats {
            begin_frame_calls: self.begin_frame_calls.load(std::sync::atomic::Ordering::Relaxed),
            flush_calls: self.flush_calls.load(std::sync::atomic::Ordering::Relaxed),
            registered_clients: self.clients.lock().len(),
        }
    }
}

static ACTIVE_UPLOAD_POLICY_SERVICE: Lazy<Mutex<Option<Arc<UploadPolicyService>>>> = Lazy::new(|| Mutex::new(None));

pub fn set_active_upload_policy_service(service: Option<Arc<UploadPolicyService>>) {
    *ACTIVE_UPLOAD_POLICY_SERVICE.lock() = service;
}

pub fn active_upload_policy_service() -> Result<Arc<UploadPolicyService>> {
    ACTIVE_UPLOAD_POLICY_SERVICE
        .lock()
        .clone()
        .ok_or(UploadStatsError::ServiceInactive("upload-policy"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::test_support::{FakeBuffer, FakeDevice};

    #[test]
    fn service_slot_is_inactive_until_set() {
        set_active_upload_service(None);
        assert!(matches!(active_upload_service().unwrap_err(), UploadStatsError::ServiceInactive("upload")));
    }

    #[test]
    fn policy_service_snapshot_then_call_invokes_every_registered_client() {
        let device: Arc<dyn Device> = Arc::new(FakeDevice::default());
        let mut upload = UploadService::new(device, 1, 4096, UploadRecorderConfig::default()).unwrap();

        let dest = Arc::new(FakeBuffer::new(16));
        let client = SingleBufferPolicyClient::new(UploadPolicyTag::Coalesced, 16, UploadTarget::from_shared(dest.clone()));
        client.stage_write(&[5u8; 16], 0).unwrap();

        let dyn_client: Arc<dyn UploadPolicyClient> = client.clone();

        let policy_service = UploadPolicyService::new();
        policy_service.register_client(dyn_client.clone());
        policy_service.flush_all(&mut upload).unwrap();

        let mut cmd = crate::rhi::test_support::FakeCommandList::new();
        upload.execute_upload_pass(&mut cmd).unwrap();
        assert_eq!(dest.read(0, 16), vec![5u8; 16]);
        assert_eq!(policy_service.get_stats().flush_calls, 1);

        policy_service.unregister_client(&dyn_client);
        assert_eq!(policy_service.get_stats().registered_clients, 0);
    }
}
