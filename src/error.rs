use thiserror::Error;

/// Every error kind this crate can surface, per the upload/statistics
/// engines' error-handling design: all of these are raised synchronously to
/// the caller and never swallowed.
#[derive(Error, Debug)]
pub enum UploadStatsError {
    #[error("write of {size} bytes at offset {offset} exceeds bounds of {limit}-byte destination")]
    OutOfBounds {
        offset: u64,
        size: u64,
        limit: u64,
    },

    #[error("buffer-base method requires a backing resource, but none is materialized")]
    NotMaterialized,

    #[error("{0} service is not active for this call")]
    ServiceInactive(&'static str),

    #[error("no byte-per-block layout is defined for format {0:?}")]
    FormatUnsupported(crate::upload::footprint::Format),

    #[error("resource registry returned a resource whose layout does not match the request")]
    ResourceTypeMismatch,

    #[error("device refused to allocate a {0}-byte page: out of host memory")]
    OutOfHostMemory(u64),
}

pub type Result<T, E = UploadStatsError> = std::result::Result<T, E>;
