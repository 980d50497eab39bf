use crate::pipeline::backend::InferenceBackend;
use crate::pipeline::combine::combine_round;
use crate::pipeline::config::{AreaFilterConfig, InferenceConfig, RatioAdjustConfig};
use crate::pipeline::generator::NextRoundGenerator;
use crate::pipeline::results::ResultProcessor;
use crate::pipeline::types::{
    InferenceFailure, OriginatingModule, PendingResize, PipelineIO, RawOutput, RecordStatus,
};
use image::imageops::FilterType;
use image::DynamicImage;
use std::time::Instant;
use tracing::{info, warn};

/// Modules that do work on the active sub-images and hand off to a result processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ModelInference(InferenceConfig),
    ImageRatioAdjust(RatioAdjustConfig),
    BboxAreaFilter(AreaFilterConfig),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ModelInference(_) => "model_inference",
            Operation::ImageRatioAdjust(_) => "image_ratio_adjust",
            Operation::BboxAreaFilter(_) => "bbox_area_filter",
        }
    }

    pub fn process(&self, io: &mut PipelineIO, backend: &mut dyn InferenceBackend) {
        match self {
            Operation::ModelInference(config) => run_inference(config, io, backend),
            Operation::ImageRatioAdjust(config) => resize_active(config, io),
            Operation::BboxAreaFilter(_) => {
                io.originating_module = Some(OriginatingModule::BboxAreaFilter);
            }
        }
    }

    fn result_processor(&self) -> ResultProcessor {
        match self {
            Operation::ModelInference(config) => ResultProcessor::for_task(config.task.task),
            Operation::ImageRatioAdjust(_) => ResultProcessor::RatioAdjust,
            Operation::BboxAreaFilter(config) => ResultProcessor::AreaFilter(config.clone()),
        }
    }

    /// Operation, its result processor, cross-tile combine for detections, then
    /// expansion into the next round.
    pub fn run_chain(&self, io: &mut PipelineIO, backend: &mut dyn InferenceBackend) {
        self.process(io, backend);
        self.result_processor().process(io);

        if let Operation::ModelInference(config) = self {
            if config.task.task.is_combinable() {
                let (round, threshold) = (io.current_round, io.active_config.combine_iou_threshold);
                combine_round(io, round, threshold);
            }
        }

        NextRoundGenerator.process(io);
    }
}

fn run_inference(config: &InferenceConfig, io: &mut PipelineIO, backend: &mut dyn InferenceBackend) {
    io.active_config = config.task.clone();
    io.originating_module = Some(OriginatingModule::ModelInference(config.task.task));
    io.raw_outputs.clear();

    let keys = io.active_keys();
    let start = Instant::now();
    let results = {
        let images: Vec<&DynamicImage> = keys
            .iter()
            .filter_map(|k| io.sub_images.get(k))
            .map(|r| r.image.as_ref())
            .collect();
        backend.infer_batch(&images, &io.active_config)
    };

    let mut failed = 0;
    for (key, result) in keys.into_iter().zip(results) {
        match result {
            Ok(predictions) => {
                io.raw_outputs.push(RawOutput {
                    source: key,
                    predictions,
                });
                io.set_status(key, RecordStatus::Consumed);
            }
            Err(error) => {
                warn!("Inference failed for sub-image {}: {}", key, error);
                failed += 1;
                io.failures.push(InferenceFailure {
                    key,
                    round: io.current_round,
                    error,
                });
                io.set_status(key, RecordStatus::Discarded);
            }
        }
    }

    info!(
        "Round {}: {} inference ({:?}) on {} sub-images, {} failed, {:.1}ms",
        io.current_round,
        backend.name(),
        config.task.task,
        io.raw_outputs.len() + failed,
        failed,
        start.elapsed().as_secs_f64() * 1000.0
    );
}

fn resize_active(config: &RatioAdjustConfig, io: &mut PipelineIO) {
    io.originating_module = Some(OriginatingModule::ImageRatioAdjust);
    io.pending_resizes.clear();

    for key in io.active_keys() {
        let Some(record) = io.sub_images.get(&key) else {
            continue;
        };
        let w = ((record.width as f64 * config.horizontal_ratio).round() as u32).max(1);
        let h = ((record.height as f64 * config.vertical_ratio).round() as u32).max(1);
        let image = record.image.resize_exact(w, h, FilterType::Triangle);
        let ratio = (w as f64 / record.width as f64, h as f64 / record.height as f64);

        io.pending_resizes.push(PendingResize {
            source: key,
            image,
            size: (w, h),
            ratio,
        });
        io.set_status(key, RecordStatus::Consumed);
    }
}
