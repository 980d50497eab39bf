pub mod batch;
pub mod error;
pub mod pipeline;
pub mod run_context;
pub mod web;

pub use error::{ConfigError, InferenceError, PipelineError};
pub use pipeline::backend::{InferenceBackend, RawPrediction};
pub use pipeline::finalize::PipelineResult;
pub use pipeline::run::{predict_with_json, predict_with_modules, PredictOptions};
