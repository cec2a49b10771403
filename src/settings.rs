//! Runtime-tunable knobs shared by the upload and statistics engines.
//!
//! Ported from `OpenRenderGraphSettings`: a single struct guarded by a
//! process-wide mutex rather than threaded through every call site, because
//! both `num_frames_in_flight` and `collect_pipeline_statistics` are read
//! from arbitrary call sites (including background threads registering
//! upload-policy clients) that don't otherwise have a settings handle.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Settings consumed by the upload and statistics engines, plus the
/// auto-aliasing / async-compute knobs that belong to sibling subsystems
/// but are clamped and stored here because they live on the same shared
/// struct in the original runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadRuntimeSettings {
    pub num_frames_in_flight: u8,
    pub collect_pipeline_statistics: bool,

    pub use_async_compute: bool,
    pub auto_alias_mode: u8,
    pub auto_alias_packing_strategy: u8,
    pub auto_alias_log_exclusion_reasons: bool,
    pub auto_alias_pool_retire_idle_frames: u32,
    pub auto_alias_pool_growth_headroom: f32,
}

impl Default for UploadRuntimeSettings {
    fn default() -> Self {
        Self {
            num_frames_in_flight: 3,
            collect_pipeline_statistics: false,
            use_async_compute: true,
            auto_alias_mode: 2,
            auto_alias_packing_strategy: 0,
            auto_alias_log_exclusion_reasons: false,
            auto_alias_pool_retire_idle_frames: 120,
            auto_alias_pool_growth_headroom: 1.5,
        }
    }
}

impl UploadRuntimeSettings {
    fn clamp(mut self) -> Self {
        self.num_frames_in_flight = self.num_frames_in_flight.max(1);
        self.auto_alias_pool_retire_idle_frames = self.auto_alias_pool_retire_idle_frames.max(1);
        self.auto_alias_pool_growth_headroom = self.auto_alias_pool_growth_headroom.max(1.0);
        self
    }
}

static SETTINGS: Lazy<Mutex<UploadRuntimeSettings>> =
    Lazy::new(|| Mutex::new(UploadRuntimeSettings::default()));

pub fn set_upload_runtime_settings(settings: UploadRuntimeSettings) {
    *SETTINGS.lock() = settings.clamp();
}

pub fn get_upload_runtime_settings() -> UploadRuntimeSettings {
    *SETTINGS.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_frames_in_flight_to_at_least_one() {
        set_upload_runtime_settings(UploadRuntimeSettings {
            num_frames_in_flight: 0,
            ..Default::default()
        });
        assert_eq!(get_upload_runtime_settings().num_frames_in_flight, 1);
    }

    #[test]
    fn clamps_growth_headroom_to_at_least_one() {
        set_upload_runtime_settings(UploadRuntimeSettings {
            auto_alias_pool_growth_headroom: 0.2,
            ..Default::default()
        });
        assert_eq!(
            get_upload_runtime_settings().auto_alias_pool_growth_headroom,
            1.0
        );
        set_upload_runtime_settings(UploadRuntimeSettings::default());
    }
}
