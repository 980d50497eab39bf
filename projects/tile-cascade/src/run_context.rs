use crate::pipeline::finalize::{write_results, PipelineResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunMetadata {
    pub original_name: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    #[serde(default)]
    pub result_count: usize,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| IMAGE_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn list_images(image_root: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(image_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_image_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    images.sort();
    images
}

/// Create (or refresh) `<output_root>/<image stem>` and its `metadata.json`.
pub fn create_run(output_root: &Path, image_name: &str) -> Result<RunMetadata> {
    let stem = Path::new(image_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid image name: {}", image_name))?;

    let output_dir = output_root.join(stem);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create run directory {:?}", output_dir))?;

    let metadata = RunMetadata {
        original_name: image_name.to_string(),
        created_at: Utc::now(),
        run_id: stem.to_string(),
        result_count: 0,
        output_dir,
    };
    write_metadata(&metadata)?;
    Ok(metadata)
}

fn write_metadata(metadata: &RunMetadata) -> Result<()> {
    let metadata_path = metadata.output_dir.join("metadata.json");
    let content = serde_json::to_string_pretty(metadata)?;
    fs::write(metadata_path, content)?;
    Ok(())
}

/// Persist a finished prediction: metadata, the module list it ran and its results.
pub fn store_run(
    output_root: &Path,
    image_name: &str,
    modules: &serde_json::Value,
    result: &PipelineResult,
) -> Result<RunMetadata> {
    let mut metadata = create_run(output_root, image_name)?;
    metadata.result_count = result.predictions().len();
    write_metadata(&metadata)?;

    fs::write(
        metadata.output_dir.join("modules.json"),
        serde_json::to_string_pretty(modules)?,
    )?;
    write_results(result, &metadata.output_dir)?;
    Ok(metadata)
}

pub fn list_runs(output_root: &Path) -> Result<Vec<(String, RunMetadata)>> {
    let mut outputs = Vec::new();

    if !output_root.exists() {
        return Ok(outputs);
    }

    for entry in fs::read_dir(output_root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            let metadata_path = path.join("metadata.json");
            if metadata_path.exists() {
                let content = fs::read_to_string(metadata_path)?;
                let mut metadata: RunMetadata = serde_json::from_str(&content)?;
                metadata.output_dir = path.clone();
                let name = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                outputs.push((name, metadata));
            }
        }
    }

    outputs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(outputs)
}
