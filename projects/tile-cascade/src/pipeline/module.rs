use crate::pipeline::backend::InferenceBackend;
use crate::pipeline::combine::CombineResults;
use crate::pipeline::config::SaveImageConfig;
use crate::pipeline::operation::Operation;
use crate::pipeline::orchestrator::ProcessPipeline;
use crate::pipeline::results::ResultProcessor;
use crate::pipeline::slicing::{SingleImageGenerator, TilingGenerator};
use crate::pipeline::types::PipelineIO;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum ImageGenerator {
    Tiling(TilingGenerator),
    Single(SingleImageGenerator),
}

impl ImageGenerator {
    pub fn process(&self, io: &mut PipelineIO) {
        match self {
            ImageGenerator::Tiling(g) => g.process(io),
            ImageGenerator::Single(g) => g.process(io),
        }
    }
}

/// A node of the module tree.
#[derive(Debug, Clone)]
pub enum Module {
    Generator(ImageGenerator),
    Operation(Operation),
    ResultProcess(ResultProcessor),
    Combine(CombineResults),
    Visualization,
    SaveImage(SaveImageConfig),
    Pipeline(ProcessPipeline),
}

impl Module {
    pub fn name(&self) -> &'static str {
        match self {
            Module::Generator(ImageGenerator::Tiling(_)) => "sliding_window",
            Module::Generator(ImageGenerator::Single(_)) => "single_image",
            Module::Operation(op) => op.name(),
            Module::ResultProcess(ResultProcessor::Classification) => "classification_result",
            Module::ResultProcess(ResultProcessor::RotatedDetection) => "rotated_detection_result",
            Module::ResultProcess(_) => "detection_result",
            Module::Combine(_) => "combine_results",
            Module::Visualization => "visualization",
            Module::SaveImage(_) => "save_image",
            Module::Pipeline(_) => "pipeline",
        }
    }

    /// Rounds this module advances the run by.
    pub fn round_count(&self) -> usize {
        match self {
            Module::Pipeline(inner) => inner.round_count(),
            _ => 1,
        }
    }

    /// Run one leaf module. Operations run their whole chain.
    pub fn process(&self, io: &mut PipelineIO, backend: &mut dyn InferenceBackend) {
        match self {
            Module::Generator(g) => g.process(io),
            Module::Operation(op) => op.run_chain(io, backend),
            Module::ResultProcess(p) => p.process(io),
            Module::Combine(c) => c.process(io),
            Module::Visualization => log_summary(io),
            Module::SaveImage(config) => {
                if let Some(dir) = &config.save_path {
                    save_active(io, dir);
                }
            }
            Module::Pipeline(inner) => inner.process(io, backend),
        }
    }
}

fn log_summary(io: &PipelineIO) {
    let latest = io.latest_result_round();
    let (entries, kept, suppressed) = latest
        .map(|round| {
            io.results
                .values()
                .filter(|e| e.round == round)
                .fold((0, 0, 0), |(n, k, s), e| {
                    let sup = e.predictions.iter().filter(|p| p.is_suppressed()).count();
                    (n + 1, k + e.predictions.len() - sup, s + sup)
                })
        })
        .unwrap_or((0, 0, 0));

    info!(
        "Round {}: {} active sub-images, {} result entries in round {:?} ({} kept, {} suppressed), {} failures",
        io.current_round,
        io.active_keys().len(),
        entries,
        latest,
        kept,
        suppressed,
        io.failures.len()
    );
}

/// Write every active sub-image as `r{round}_s{slot}.png`. Failures are logged only.
fn save_active(io: &PipelineIO, dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Cannot create {:?}: {}", dir, e);
        return;
    }
    for key in io.active_keys() {
        let Some(record) = io.sub_images.get(&key) else {
            continue;
        };
        let path = dir.join(format!("r{:02}_s{:03}.png", key.round, key.slot));
        if let Err(e) = record.image.save(&path) {
            warn!("Failed to save {:?}: {}", path, e);
        }
    }
}
