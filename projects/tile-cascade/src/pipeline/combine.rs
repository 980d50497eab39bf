use crate::pipeline::geometry::{compute_iou, rotated_iou};
use crate::pipeline::types::{BoxShape, PipelineIO, RotatedRect, SlotKey};
use tracing::debug;

/// Cross-tile de-duplication.
///
/// A prediction is suppressed when a prediction of the same category from a different
/// sub-image overlaps it by at least `threshold` IoU and beats it: a higher score, or an
/// equal score and an earlier `(result key, index)` position. Flags are only ever set, so
/// running the pass twice changes nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CombineResults {
    /// Falls back to the active task configuration when unset
    pub threshold: Option<f64>,
}

impl CombineResults {
    /// Standalone use: combine the most recent result round.
    pub fn process(&self, io: &mut PipelineIO) {
        let Some(round) = io.latest_result_round() else {
            return;
        };
        let threshold = self
            .threshold
            .unwrap_or(io.active_config.combine_iou_threshold);
        combine_round(io, round, threshold);
    }
}

struct Candidate {
    key: SlotKey,
    index: usize,
    source: SlotKey,
    category: (i64, String),
    score: f32,
    shape: BoxShape,
}

fn as_rotated(shape: &BoxShape) -> RotatedRect {
    match shape {
        BoxShape::Rotated(r) => *r,
        BoxShape::Axis(b) => RotatedRect {
            cx: b.x + b.w / 2.0,
            cy: b.y + b.h / 2.0,
            w: b.w,
            h: b.h,
            angle: 0.0,
        },
    }
}

/// IoU of two global boxes; polygon IoU when either is rotated.
pub fn shape_iou(a: &BoxShape, b: &BoxShape) -> f64 {
    match (a, b) {
        (BoxShape::Axis(a), BoxShape::Axis(b)) => compute_iou(a, b),
        _ => rotated_iou(&as_rotated(a), &as_rotated(b)),
    }
}

/// Flag duplicates among the combinable entries of `round`. Returns how many predictions
/// were newly suppressed.
pub fn combine_round(io: &mut PipelineIO, round: usize, threshold: f64) -> usize {
    let mut candidates = Vec::new();
    for (key, entry) in io.results.iter() {
        if entry.round != round || !entry.task.is_combinable() {
            continue;
        }
        for (index, prediction) in entry.predictions.iter().enumerate() {
            let Some(shape) = prediction.meta.global_bbox.or(prediction.bbox) else {
                continue;
            };
            candidates.push(Candidate {
                key: *key,
                index,
                source: entry.source,
                category: (prediction.category_id, prediction.category_name.clone()),
                score: prediction.score,
                shape,
            });
        }
    }

    // Candidates are in (key, index) order, so `i < j` means i was seen first
    let mut losers = Vec::new();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            let (a, b) = (&candidates[i], &candidates[j]);
            if a.source == b.source || a.category != b.category {
                continue;
            }
            if shape_iou(&a.shape, &b.shape) < threshold {
                continue;
            }
            let loser = if b.score > a.score { a } else { b };
            losers.push((loser.key, loser.index));
        }
    }

    let mut newly = 0;
    for (key, index) in losers {
        if let Some(prediction) = io
            .results
            .get_mut(&key)
            .and_then(|entry| entry.predictions.get_mut(index))
        {
            if !prediction.meta.combine_suppressed {
                prediction.meta.combine_suppressed = true;
                newly += 1;
            }
        }
    }

    debug!(
        "Combined round {} at IoU {}: {} candidates, {} newly suppressed",
        round,
        threshold,
        candidates.len(),
        newly
    );
    newly
}
