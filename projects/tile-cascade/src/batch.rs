// Batch prediction: independent images spread across worker threads
//
// Each worker owns its own backend, so backends never need to be shared.

use crate::pipeline::backend::InferenceBackend;
use crate::pipeline::config::ModuleDescriptor;
use crate::pipeline::finalize::PipelineResult;
use crate::pipeline::run::{load_image, predict_with_modules, PredictOptions};
use anyhow::{Context, Result};
use crossbeam::channel;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info};

/// Outcome for one image of a batch
#[derive(Debug)]
pub struct BatchItem {
    pub image_path: PathBuf,
    pub result: Result<PipelineResult>,
}

fn predict_file(
    path: &Path,
    descriptors: &[ModuleDescriptor],
    backend: &mut dyn InferenceBackend,
    options: &PredictOptions,
) -> Result<PipelineResult> {
    let image =
        load_image(path).with_context(|| format!("Failed to load image {:?}", path))?;
    let origin = path.to_string_lossy();
    Ok(predict_with_modules(
        image,
        &origin,
        descriptors,
        backend,
        options,
    )?)
}

/// Run the same module list over many images on `workers` threads. Results come back
/// in input order.
pub fn predict_batch<F>(
    images: Vec<PathBuf>,
    descriptors: &[ModuleDescriptor],
    workers: usize,
    make_backend: F,
    options: &PredictOptions,
) -> Result<Vec<BatchItem>>
where
    F: Fn() -> Box<dyn InferenceBackend> + Sync,
{
    let total = images.len();
    let workers = workers.clamp(1, total.max(1));

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} img/s, {eta})")?
            .progress_chars("#>-"),
    );

    let (tx_job, rx_job) = channel::unbounded::<(usize, PathBuf)>();
    let (tx_done, rx_done) = channel::unbounded::<(usize, BatchItem)>();
    for job in images.into_iter().enumerate() {
        tx_job.send(job)?;
    }
    drop(tx_job);

    info!("Starting batch of {} images on {} workers", total, workers);

    thread::scope(|scope| {
        for worker_id in 0..workers {
            let rx_job = rx_job.clone();
            let tx_done = tx_done.clone();
            let make_backend = &make_backend;
            let pb = pb.clone();
            scope.spawn(move || {
                let mut backend = make_backend();
                for (index, image_path) in rx_job {
                    let result = predict_file(&image_path, descriptors, backend.as_mut(), options);
                    if let Err(e) = &result {
                        error!("Worker {} failed on {:?}: {:#}", worker_id, image_path, e);
                    }
                    pb.inc(1);
                    if tx_done.send((index, BatchItem { image_path, result })).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx_done);
    pb.finish_and_clear();

    let mut items: Vec<(usize, BatchItem)> = rx_done.into_iter().collect();
    items.sort_by_key(|(index, _)| *index);
    Ok(items.into_iter().map(|(_, item)| item).collect())
}
