//! CPU-to-GPU upload staging and coalescing: the Ring Pager, Upload
//! Recorder, Overlap Resolver, Texture Footprint Planner, Buffer Upload
//! Policy, and the Upload Service / Upload Policy Service façades over
//! them.

pub mod footprint;
pub mod overlap;
pub mod page;
pub mod policy;
pub mod recorder;
pub mod service;
pub mod target;
pub mod update;

pub use footprint::{Format, Footprint, FootprintPlan, SourceSubresource};
pub use page::{PageAllocation, RingPager, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use policy::{BufferUploadPolicyState, BufferUploadPolicyStats, UploadPolicyTag};
pub use recorder::{UploadRecorder, UploadRecorderConfig};
pub use service::{
    active_upload_policy_service, active_upload_service, set_active_upload_policy_service, set_active_upload_service,
    SingleBufferPolicyClient, UploadPolicyClient, UploadPolicyService, UploadPolicyServiceStats, UploadService,
};
pub use target::{UploadResolveContext, UploadTarget};
pub use update::{BufferUpdate, CopyRequest, Provenance, TextureUpdate};
