mod cli;

use anyhow::{Context, Result};
use cli::{Args, Command};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tile_cascade::batch::predict_batch;
use tile_cascade::pipeline::backend::backend_from_name;
use tile_cascade::pipeline::config::parse_descriptors;
use tile_cascade::pipeline::run::{load_image, predict_with_modules, PredictOptions};
use tile_cascade::run_context::{list_images, store_run};
use tile_cascade::web::server::{run_server, AppState};
use tracing::{error, info};

fn read_modules(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read module list {:?}", path))?;
    Ok(serde_json::from_str(&content)?)
}

fn image_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

async fn predict(
    backend_name: String,
    image: PathBuf,
    modules: PathBuf,
    options: PredictOptions,
    output_root: Option<PathBuf>,
) -> Result<()> {
    let modules = read_modules(&modules)?;
    let descriptors = parse_descriptors(&modules)?;

    let image_for_run = image.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut backend = backend_from_name(&backend_name);
        let img = load_image(&image_for_run)?;
        predict_with_modules(
            img,
            &image_for_run.to_string_lossy(),
            &descriptors,
            backend.as_mut(),
            &options,
        )
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(root) = output_root {
        let metadata = store_run(&root, &image_name(&image), &modules, &result)?;
        info!("Stored run in {:?}", metadata.output_dir);
    }
    Ok(())
}

async fn batch(
    backend_name: String,
    image_root: PathBuf,
    modules: PathBuf,
    workers: usize,
    output_root: Option<PathBuf>,
) -> Result<()> {
    let modules = read_modules(&modules)?;
    let descriptors = parse_descriptors(&modules)?;
    let images = list_images(&image_root);
    info!("Found {} images under {:?}", images.len(), image_root);

    let items = tokio::task::spawn_blocking(move || {
        predict_batch(
            images,
            &descriptors,
            workers,
            || backend_from_name(&backend_name),
            &PredictOptions::default(),
        )
    })
    .await??;

    let mut failed = 0;
    for item in &items {
        match &item.result {
            Ok(result) => {
                if let Some(root) = &output_root {
                    let name = item
                        .image_path
                        .strip_prefix(&image_root)
                        .unwrap_or(&item.image_path)
                        .to_string_lossy()
                        .to_string();
                    store_run(root, &name, &modules, result)?;
                }
            }
            Err(e) => {
                failed += 1;
                error!("{:?}: {:#}", item.image_path, e);
            }
        }
    }

    info!("Batch finished: {} images, {} failed", items.len(), failed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    match args.command {
        Command::Predict {
            image,
            modules,
            round,
            tile_positions,
            output_root,
        } => {
            let options = PredictOptions {
                round,
                include_tile_positions: tile_positions,
                is_active: None,
            };
            predict(args.backend, image, modules, options, output_root).await?;
        }
        Command::Batch {
            image_root,
            modules,
            workers,
            output_root,
        } => {
            batch(args.backend, image_root, modules, workers, output_root).await?;
        }
        Command::Serve {
            host,
            port,
            image_root,
            output_root,
        } => {
            let state = AppState {
                image_root,
                output_root,
                backend: Arc::new(Mutex::new(backend_from_name(&args.backend))),
            };
            run_server(host, port, state).await?;
        }
    }

    Ok(())
}
