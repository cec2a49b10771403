//! CPU-to-GPU upload staging/coalescing and per-pass timing/pipeline-statistics
//! readback for a render graph runtime built on an opaque graphics RHI.
//!
//! The crate is organized the way the runtime it was ported from splits these
//! concerns: [`rhi`] is the narrow trait surface the rest of the crate runs
//! against (no concrete backend lives here); [`upload`] is the Upload
//! Staging and Coalescing Engine (Ring Pager, Upload Recorder, Overlap
//! Resolver, Texture Footprint Planner, Buffer Upload Policy, and the Upload
//! Service / Upload Policy Service façades); [`stats`] is the Per-Pass Timing
//! & Pipeline-Statistics Readback Engine (Query Heap Manager, Stats
//! Aggregator, Statistics Service); [`settings`] is the shared
//! runtime-tunable knobs; [`error`] is the single error enum every fallible
//! call in the crate returns. Both engines are reached through their own
//! process-wide active-service slot (`upload::service::active_upload_service`,
//! `stats::service::active_statistics_service`) rather than a shared generic
//! resource registry.

pub mod error;
pub mod rhi;
pub mod settings;
pub mod stats;
pub mod upload;
pub mod util;

pub use error::{Result, UploadStatsError};
