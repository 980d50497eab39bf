use crate::error::ConfigError;
use crate::pipeline::combine::CombineResults;
use crate::pipeline::config::{auto_process_pattern, ModuleDescriptor};
use crate::pipeline::module::{ImageGenerator, Module};
use crate::pipeline::operation::Operation;
use crate::pipeline::orchestrator::ProcessPipeline;
use crate::pipeline::results::ResultProcessor;
use crate::pipeline::slicing::{SingleImageGenerator, TilingGenerator};

/// Build the top-level pipeline. An empty list is rejected.
pub fn build_pipeline(descriptors: &[ModuleDescriptor]) -> Result<ProcessPipeline, ConfigError> {
    if descriptors.is_empty() {
        return Err(ConfigError::EmptyModuleList);
    }
    Ok(ProcessPipeline::new(build_modules(descriptors)?))
}

fn build_modules(descriptors: &[ModuleDescriptor]) -> Result<Vec<Module>, ConfigError> {
    descriptors
        .iter()
        .enumerate()
        .map(|(index, descriptor)| {
            let mut module = build_module(descriptor)?;
            // An uncollapsed inference/result/combine run combines at the same threshold
            // as the collapsed form would.
            if let (Some(threshold), Module::Operation(Operation::ModelInference(config))) =
                (auto_process_pattern(descriptors, index), &mut module)
            {
                config.task.combine_iou_threshold = threshold;
            }
            Ok(module)
        })
        .collect()
}

/// Build a single module, validating the fields it needs.
pub fn build_module(descriptor: &ModuleDescriptor) -> Result<Module, ConfigError> {
    let module = match descriptor {
        ModuleDescriptor::SlidingWindow(config) => {
            config.validate()?;
            Module::Generator(ImageGenerator::Tiling(TilingGenerator::new(config.clone())))
        }
        ModuleDescriptor::SingleImage => Module::Generator(ImageGenerator::Single(SingleImageGenerator)),
        ModuleDescriptor::ModelInference(config) => {
            let has_model = config
                .task
                .model_path
                .as_deref()
                .map(|p| !p.trim().is_empty())
                .unwrap_or(false);
            if !has_model {
                return Err(ConfigError::MissingField {
                    module: "model_inference",
                    field: "model_path",
                });
            }
            if !(0.0..=1.0).contains(&config.task.combine_iou_threshold) {
                return Err(ConfigError::InvalidGeometry(format!(
                    "combine_iou_threshold must be in [0, 1], got {}",
                    config.task.combine_iou_threshold
                )));
            }
            Module::Operation(Operation::ModelInference(config.clone()))
        }
        ModuleDescriptor::ImageRatioAdjust(config) => {
            let valid = |r: f64| r.is_finite() && r > 0.0;
            if !valid(config.horizontal_ratio) || !valid(config.vertical_ratio) {
                return Err(ConfigError::InvalidGeometry(format!(
                    "resize ratios must be positive, got {}x{}",
                    config.horizontal_ratio, config.vertical_ratio
                )));
            }
            Module::Operation(Operation::ImageRatioAdjust(config.clone()))
        }
        ModuleDescriptor::BboxAreaFilter(config) => {
            Module::Operation(Operation::BboxAreaFilter(config.clone()))
        }
        ModuleDescriptor::ClassificationResult => {
            Module::ResultProcess(ResultProcessor::Classification)
        }
        ModuleDescriptor::DetectionResult => Module::ResultProcess(ResultProcessor::Detection),
        ModuleDescriptor::RotatedDetectionResult => {
            Module::ResultProcess(ResultProcessor::RotatedDetection)
        }
        ModuleDescriptor::CombineResults(config) => Module::Combine(CombineResults {
            threshold: config.combine_iou_threshold,
        }),
        ModuleDescriptor::Visualization => Module::Visualization,
        ModuleDescriptor::SaveImage(config) => Module::SaveImage(config.clone()),
        ModuleDescriptor::Pipeline(children) => {
            if children.is_empty() {
                return Err(ConfigError::EmptyPipeline);
            }
            Module::Pipeline(ProcessPipeline::new(build_modules(children)?))
        }
    };
    Ok(module)
}
