use std::sync::Arc;

use crate::rhi::{GpuResource, RegistryHandle, ResourceRegistry};

/// Where an upload (or deferred copy) ultimately lands: either a handle
/// resolved through the frame's registry, or a resource the caller already
/// holds a strong reference to. Ported from `UploadTarget` in
/// `Render/Runtime/UploadTypes.h`.
#[derive(Clone)]
pub enum UploadTarget {
    RegistryHandle(RegistryHandle),
    Pinned(Arc<dyn GpuResource>),
}

impl UploadTarget {
    pub fn from_handle(handle: RegistryHandle) -> Self {
        Self::RegistryHandle(handle)
    }

    pub fn from_shared(resource: Arc<dyn GpuResource>) -> Self {
        Self::Pinned(resource)
    }

    /// Resolve against the frame's installed context. Registry handles with
    /// an epoch that doesn't match the installed context, or with no
    /// context installed at all, fail to resolve.
    pub fn resolve(&self, ctx: &UploadResolveContext) -> Option<Arc<dyn GpuResource>> {
        match self {
            Self::Pinned(resource) => Some(resource.clone()),
            Self::RegistryHandle(handle) => {
                let registry = ctx.registry.as_ref()?;
                if handle.epoch != ctx.epoch {
                    return None;
                }
                registry.resolve(*handle)
            }
        }
    }
}

impl PartialEq for UploadTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::RegistryHandle(a), Self::RegistryHandle(b)) => a == b,
            (Self::Pinned(a), Self::Pinned(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegistryHandle(h) => f.debug_tuple("RegistryHandle").field(h).finish(),
            Self::Pinned(_) => f.write_str("Pinned(..)"),
        }
    }
}

/// Per-frame binding allowing `UploadTarget::RegistryHandle` values to be
/// dereferenced safely across resource rebuilds. Installed once per frame
/// by the frame driver via `UploadService::set_upload_resolve_context`.
#[derive(Clone, Default)]
pub struct UploadResolveContext {
    pub registry: Option<Arc<dyn ResourceRegistry>>,
    pub epoch: u64,
}
