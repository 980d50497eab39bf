use crate::pipeline::types::TaskKind;
use thiserror::Error;

/// Problems found while parsing or building a module tree. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("module list is empty")]
    EmptyModuleList,

    #[error("module descriptor is missing `module_type`")]
    MissingModuleType,

    #[error("unknown module_type `{0}`")]
    UnknownModuleType(String),

    #[error("`{module}` descriptor is missing required field `{field}`")]
    MissingField {
        module: &'static str,
        field: &'static str,
    },

    #[error("`pipeline` descriptor has no child modules")]
    EmptyPipeline,

    #[error("invalid `{module}` descriptor: {source}")]
    InvalidDescriptor {
        module: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Failure of a single backend call. Attached to the sub-image it was made for.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("backend failed: {0}")]
    Backend(String),

    #[error("no inference backend available: {0}")]
    Unavailable(String),

    #[error("backend does not support task {0:?}")]
    UnsupportedTask(TaskKind),

    #[error("inference cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
