use crate::error::{ConfigError, Result};
use crate::pipeline::backend::InferenceBackend;
use crate::pipeline::config::{
    collapse_auto_process, ensure_image_source, parse_descriptors, ModuleDescriptor,
};
use crate::pipeline::factory::build_pipeline;
use crate::pipeline::finalize::{assemble, PipelineResult};
use crate::pipeline::orchestrator::ProcessPipeline;
use crate::pipeline::types::PipelineIO;
use image::DynamicImage;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct PredictOptions {
    /// Round to assemble; latest when unset
    pub round: Option<usize>,
    pub include_tile_positions: bool,
    pub is_active: Option<Arc<AtomicBool>>,
}

/// Rewrite and build a descriptor list into a runnable pipeline.
pub fn prepare_pipeline(descriptors: &[ModuleDescriptor]) -> Result<ProcessPipeline, ConfigError> {
    if descriptors.is_empty() {
        return Err(ConfigError::EmptyModuleList);
    }
    let descriptors = collapse_auto_process(ensure_image_source(descriptors.to_vec()));
    build_pipeline(&descriptors)
}

/// Run a module list over one image and assemble its predictions.
pub fn predict_with_modules(
    image: DynamicImage,
    origin_path: &str,
    descriptors: &[ModuleDescriptor],
    backend: &mut dyn InferenceBackend,
    options: &PredictOptions,
) -> Result<PipelineResult> {
    let mut pipeline = prepare_pipeline(descriptors)?;
    if let Some(flag) = &options.is_active {
        pipeline = pipeline.with_active_flag(flag.clone());
    }

    let start = Instant::now();
    let mut io = PipelineIO::new(image, origin_path);
    pipeline.process(&mut io, backend);
    let result = assemble(&io, options.round, options.include_tile_positions);

    info!(
        "Predicted {} in {:.1}ms: {} results, status {:?}",
        origin_path,
        start.elapsed().as_secs_f64() * 1000.0,
        result.predictions().len(),
        result.status
    );
    Ok(result)
}

/// Same as [`predict_with_modules`], with descriptors still in JSON form.
pub fn predict_with_json(
    image: DynamicImage,
    origin_path: &str,
    modules: &Value,
    backend: &mut dyn InferenceBackend,
    options: &PredictOptions,
) -> Result<PipelineResult> {
    let descriptors = parse_descriptors(modules)?;
    predict_with_modules(image, origin_path, &descriptors, backend, options)
}

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

/// Read a descriptor list from a JSON file.
pub fn load_descriptors(path: &Path) -> Result<Vec<ModuleDescriptor>> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    Ok(parse_descriptors(&value)?)
}
