// Pipeline orchestrator: runs a module tree round by round
//
// Every leaf module is one round. Operations run their full chain (inference,
// interpretation, combine, next-round expansion) inside that round.

use crate::pipeline::backend::InferenceBackend;
use crate::pipeline::module::Module;
use crate::pipeline::types::PipelineIO;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ProcessPipeline {
    pub modules: Vec<Module>,
    /// Cleared by the host to stop the run between modules
    is_active: Option<Arc<AtomicBool>>,
}

impl ProcessPipeline {
    pub fn new(modules: Vec<Module>) -> Self {
        Self {
            modules,
            is_active: None,
        }
    }

    pub fn with_active_flag(mut self, is_active: Arc<AtomicBool>) -> Self {
        self.is_active = Some(is_active);
        self
    }

    /// Leaf modules in the tree; nested pipelines count their children.
    pub fn round_count(&self) -> usize {
        self.modules.iter().map(Module::round_count).sum()
    }

    pub fn process(&self, io: &mut PipelineIO, backend: &mut dyn InferenceBackend) {
        if io.total_round == 0 {
            io.total_round = io.current_round + self.round_count();
        }
        info!(
            "Running {} modules over {} rounds for {}",
            self.modules.len(),
            io.total_round,
            io.origin_path
        );
        self.run_modules(io, backend, self.is_active.as_deref());
    }

    fn run_modules(
        &self,
        io: &mut PipelineIO,
        backend: &mut dyn InferenceBackend,
        is_active: Option<&AtomicBool>,
    ) {
        for module in &self.modules {
            if io.cancelled {
                return;
            }
            if let Some(flag) = is_active {
                if !flag.load(Ordering::Relaxed) {
                    warn!(
                        "Run for {} cancelled before round {}",
                        io.origin_path, io.current_round
                    );
                    io.cancelled = true;
                    return;
                }
            }

            match module {
                Module::Pipeline(inner) => {
                    inner.run_modules(io, backend, is_active.or(inner.is_active.as_deref()))
                }
                leaf => {
                    let start = Instant::now();
                    leaf.process(io, backend);
                    debug!(
                        "Round {} ({}) took {:.1}ms",
                        io.current_round,
                        leaf.name(),
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                    io.current_round += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::{InferenceConfig, SaveImageConfig};
    use crate::pipeline::module::ImageGenerator;
    use crate::pipeline::operation::Operation;
    use crate::pipeline::slicing::{SingleImageGenerator, SliceConfig, TilingGenerator};
    use crate::pipeline::test_utils::{image_with_squares, BlobBackend};
    use crate::pipeline::types::{TaskConfig, TaskKind, MEMORY_IMAGE};

    fn inference(task: TaskKind) -> Module {
        Module::Operation(Operation::ModelInference(InferenceConfig {
            task: TaskConfig {
                task,
                model_path: Some("blob.onnx".into()),
                ..TaskConfig::default()
            },
            auto_process_results: false,
        }))
    }

    #[test]
    fn test_nested_round_count() {
        let pipeline = ProcessPipeline::new(vec![
            Module::Generator(ImageGenerator::Single(SingleImageGenerator)),
            Module::Pipeline(ProcessPipeline::new(vec![
                Module::Visualization,
                Module::Pipeline(ProcessPipeline::new(vec![
                    Module::Visualization,
                    Module::SaveImage(SaveImageConfig::default()),
                ])),
            ])),
            Module::Visualization,
        ]);
        assert_eq!(pipeline.round_count(), 5);

        let mut io = PipelineIO::new(image_with_squares(8, 8, &[]), MEMORY_IMAGE);
        pipeline.process(&mut io, &mut BlobBackend::new(vec![0.9]));
        assert_eq!(io.total_round, 5);
        assert_eq!(io.current_round, 5);
    }

    #[test]
    fn test_cascade_stops_at_terminal_round() {
        let image = image_with_squares(200, 200, &[(20, 30, 10, 10), (150, 150, 20, 20)]);
        let mut io = PipelineIO::new(image, MEMORY_IMAGE);
        let pipeline = ProcessPipeline::new(vec![
            Module::Generator(ImageGenerator::Tiling(TilingGenerator::new(SliceConfig::new(100, 0)))),
            inference(TaskKind::Detection),
            inference(TaskKind::Classification),
        ]);
        pipeline.process(&mut io, &mut BlobBackend::new(vec![0.9]));

        assert_eq!(io.total_round, 3);
        // Four tiles, then one crop per square; the last round makes nothing
        assert_eq!(io.sub_images.len(), 6);
        assert!(io.sub_images.keys().all(|k| k.round < 2));
        assert_eq!(io.result_keys_in_round(2).len(), 2);
    }

    #[test]
    fn test_cleared_flag_stops_run() {
        let flag = Arc::new(AtomicBool::new(false));
        let pipeline = ProcessPipeline::new(vec![
            Module::Generator(ImageGenerator::Single(SingleImageGenerator)),
            inference(TaskKind::Detection),
        ])
        .with_active_flag(flag);

        let mut io = PipelineIO::new(image_with_squares(8, 8, &[]), MEMORY_IMAGE);
        let mut backend = BlobBackend::new(vec![0.9]);
        pipeline.process(&mut io, &mut backend);

        assert!(io.cancelled);
        assert_eq!(io.current_round, 0);
        assert_eq!(backend.calls(), 0);
    }
}
