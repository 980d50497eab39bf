use crate::error::Result;
use crate::pipeline::types::{BoxShape, PipelineIO, SlotKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// Some sub-images failed or the run was cancelled
    Partial,
}

/// One prediction in global coordinates
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputPrediction {
    pub category_id: i64,
    pub category_name: String,
    pub score: f32,
    /// `[x, y, w, h]`, or `[cx, cy, w, h, angle]` for rotated boxes
    pub bbox: Vec<f64>,
    pub with_mask: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SampleResult {
    pub results: Vec<OutputPrediction>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TilePosition {
    pub row: usize,
    pub col: usize,
    /// `[x, y, w, h]` in the original image
    pub bbox: [f64; 4],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub sub_image: SlotKey,
    pub round: usize,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub status: RunStatus,
    pub sample_results: Vec<SampleResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_small_img_pos_list: Option<Vec<TilePosition>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureReport>,
}

impl PipelineResult {
    /// Predictions of the first (and usually only) sample
    pub fn predictions(&self) -> &[OutputPrediction] {
        self.sample_results
            .first()
            .map(|s| s.results.as_slice())
            .unwrap_or(&[])
    }
}

/// Flatten the non-suppressed predictions of `round` (default: the latest round with
/// results) into the public result structure.
pub fn assemble(io: &PipelineIO, round: Option<usize>, include_tile_positions: bool) -> PipelineResult {
    let selected = round.or_else(|| io.latest_result_round());

    let results = selected
        .map(|round| {
            io.results
                .values()
                .filter(|entry| entry.round == round)
                .flat_map(|entry| entry.predictions.iter())
                .filter(|p| !p.is_suppressed())
                .filter_map(|p| {
                    let shape: BoxShape = p.meta.global_bbox.or(p.bbox)?;
                    Some(OutputPrediction {
                        category_id: p.category_id,
                        category_name: p.category_name.clone(),
                        score: p.score,
                        bbox: shape.to_vec(),
                        with_mask: p.mask.is_some(),
                        area: p.area,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let all_small_img_pos_list = include_tile_positions.then(|| {
        io.sub_images
            .iter()
            .filter(|(key, record)| key.round == 0 && record.parent.is_none())
            .filter_map(|(_, record)| {
                let (row, col) = record.slice_position?;
                Some(TilePosition {
                    row,
                    col,
                    bbox: [
                        record.frame.origin.x,
                        record.frame.origin.y,
                        record.width as f64,
                        record.height as f64,
                    ],
                })
            })
            .collect()
    });

    let failures: Vec<FailureReport> = io
        .failures
        .iter()
        .map(|f| FailureReport {
            sub_image: f.key,
            round: f.round,
            error: f.error.to_string(),
        })
        .collect();

    let status = if failures.is_empty() && !io.cancelled {
        RunStatus::Success
    } else {
        RunStatus::Partial
    };

    PipelineResult {
        status,
        sample_results: vec![SampleResult { results }],
        all_small_img_pos_list,
        failures,
    }
}

/// Save the result as `results.json` in `output_dir`.
pub fn write_results(result: &PipelineResult, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join("results.json");
    let json = serde_json::to_string_pretty(result)?;
    fs::write(&path, json)?;
    Ok(path)
}
