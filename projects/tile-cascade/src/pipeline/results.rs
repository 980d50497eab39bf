use crate::pipeline::backend::RawPrediction;
use crate::pipeline::config::AreaFilterConfig;
use crate::pipeline::types::{
    BBox, BoxShape, PipelineIO, Prediction, PredictionMeta, RawOutput, RecordStatus, ResultEntry,
    ResultTask, RotatedRect, SlotKey, SubImageRecord, TaskConfig, TaskKind,
};
use image::imageops::overlay;
use image::GrayImage;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info};

/// Turns backend output (or earlier results) into result entries for the current round.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultProcessor {
    Classification,
    Detection,
    RotatedDetection,
    AreaFilter(AreaFilterConfig),
    RatioAdjust,
}

impl ResultProcessor {
    /// Processor interpreting raw output of the given model task
    pub fn for_task(task: TaskKind) -> Self {
        if task.is_classification_like() {
            ResultProcessor::Classification
        } else if task.is_rotated() {
            ResultProcessor::RotatedDetection
        } else {
            ResultProcessor::Detection
        }
    }

    pub fn process(&self, io: &mut PipelineIO) {
        match self {
            ResultProcessor::Classification
            | ResultProcessor::Detection
            | ResultProcessor::RotatedDetection => self.interpret_raw(io),
            ResultProcessor::AreaFilter(config) => filter_by_area(io, config),
            ResultProcessor::RatioAdjust => record_ratio_adjust(io),
        }
    }

    fn interpret_raw(&self, io: &mut PipelineIO) {
        let raw_outputs = std::mem::take(&mut io.raw_outputs);
        if raw_outputs.is_empty() {
            return;
        }
        let config = io.active_config.clone();

        for RawOutput { source, predictions } in raw_outputs {
            let Some(record) = io.sub_images.get(&source) else {
                debug!("Raw output for unknown sub-image {}", source);
                continue;
            };
            let predictions = match self {
                ResultProcessor::Classification => classify(record, predictions, &config),
                ResultProcessor::RotatedDetection => detect_rotated(record, predictions, &config),
                _ => detect(record, predictions, &config),
            };
            io.insert_result(ResultEntry {
                round: io.current_round,
                task: ResultTask::Model(config.task),
                source,
                predictions,
            });
        }
    }
}

fn passes(raw: &RawPrediction, config: &TaskConfig) -> bool {
    raw.score >= config.threshold && config.keeps_category(&raw.category_name)
}

fn base_meta(record: &SubImageRecord) -> PredictionMeta {
    PredictionMeta {
        combine_suppressed: false,
        tile_offset: record.global_offset(),
        slice_index: record.slice_position,
        global_bbox: None,
        is_rotated: false,
    }
}

/// Category, score and top-k only. The box is the sub-image itself.
pub fn classify(
    record: &SubImageRecord,
    raw: Vec<RawPrediction>,
    config: &TaskConfig,
) -> Vec<Prediction> {
    let mut kept: Vec<RawPrediction> = raw.into_iter().filter(|p| passes(p, config)).collect();
    kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    if config.top_k > 0 {
        kept.truncate(config.top_k);
    }

    let region = record.global_region();
    kept.into_iter()
        .map(|p| Prediction {
            category_id: p.category_id,
            category_name: p.category_name,
            score: p.score,
            area: Some(region.area()),
            bbox: None,
            mask: None,
            angle: None,
            meta: PredictionMeta {
                global_bbox: Some(region),
                is_rotated: region.is_rotated(),
                ..base_meta(record)
            },
        })
        .collect()
}

/// Grow a local box by `pixels` on every side, clamped to the sub-image.
fn expand_local(bbox: [f64; 4], pixels: u32, width: u32, height: u32) -> BBox {
    let [x, y, w, h] = bbox;
    if pixels == 0 {
        return BBox::new(x, y, w, h);
    }
    let e = pixels as f64;
    let x1 = (x - e).max(0.0);
    let y1 = (y - e).max(0.0);
    let x2 = (x + w + e).min(width as f64);
    let y2 = (y + h + e).min(height as f64);
    BBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
}

/// Place a backend mask, drawn over `raw`, onto a blank canvas the size of `local`.
fn fit_mask(mask: GrayImage, raw: [f64; 4], local: &BBox) -> GrayImage {
    let w = local.w.round().max(1.0) as u32;
    let h = local.h.round().max(1.0) as u32;
    if mask.dimensions() == (w, h) {
        return mask;
    }
    let mut canvas = GrayImage::new(w, h);
    let dx = (raw[0] - local.x).round() as i64;
    let dy = (raw[1] - local.y).round() as i64;
    overlay(&mut canvas, &mask, dx, dy);
    canvas
}

pub fn detect(
    record: &SubImageRecord,
    raw: Vec<RawPrediction>,
    config: &TaskConfig,
) -> Vec<Prediction> {
    raw.into_iter()
        .filter(|p| passes(p, config))
        .filter_map(|p| {
            let bbox = p.bbox?;
            let local = expand_local(bbox, config.bbox_expand_pixels, record.width, record.height);
            let global = record.frame.map_box(&local);
            let mask = match p.mask {
                Some(mask) if config.bbox_expand_pixels > 0 => Some(fit_mask(mask, bbox, &local)),
                mask => mask,
            };
            Some(Prediction {
                category_id: p.category_id,
                category_name: p.category_name,
                score: p.score,
                area: Some(p.area.unwrap_or_else(|| local.area())),
                bbox: Some(BoxShape::Axis(local)),
                mask,
                angle: None,
                meta: PredictionMeta {
                    global_bbox: Some(global),
                    is_rotated: global.is_rotated(),
                    ..base_meta(record)
                },
            })
        })
        .collect()
}

/// Rotated boxes arrive as `[cx, cy, w, h]` plus an angle.
pub fn detect_rotated(
    record: &SubImageRecord,
    raw: Vec<RawPrediction>,
    config: &TaskConfig,
) -> Vec<Prediction> {
    raw.into_iter()
        .filter(|p| passes(p, config))
        .filter_map(|p| {
            let [cx, cy, w, h] = p.bbox?;
            let angle = p.angle.unwrap_or(0.0);
            let local = RotatedRect {
                cx,
                cy,
                w,
                h,
                angle,
            };
            let global = record.frame.map_rotated(&local);
            Some(Prediction {
                category_id: p.category_id,
                category_name: p.category_name,
                score: p.score,
                area: Some(p.area.unwrap_or_else(|| local.area())),
                bbox: Some(BoxShape::Rotated(local)),
                mask: p.mask,
                angle: Some(angle),
                meta: PredictionMeta {
                    global_bbox: Some(BoxShape::Rotated(global)),
                    is_rotated: true,
                    ..base_meta(record)
                },
            })
        })
        .collect()
}

fn filter_area(prediction: &Prediction) -> Option<f64> {
    prediction
        .box_area()
        .or_else(|| prediction.meta.global_bbox.as_ref().map(BoxShape::area))
}

/// Re-emit the latest round's predictions that pass the area test. Records that were
/// cut from a dropped prediction are discarded.
pub fn filter_by_area(io: &mut PipelineIO, config: &AreaFilterConfig) {
    let Some(latest) = io.latest_result_round() else {
        return;
    };

    let mut dropped: HashSet<(SlotKey, usize)> = HashSet::new();
    let mut survivors: Vec<ResultEntry> = Vec::new();
    let mut kept_count = 0;

    for key in io.result_keys_in_round(latest) {
        let Some(entry) = io.results.get(&key) else {
            continue;
        };
        let mut predictions = Vec::new();
        for (index, prediction) in entry.predictions.iter().enumerate() {
            let keep = !prediction.is_suppressed()
                && filter_area(prediction)
                    .map(|area| config.keeps(area))
                    .unwrap_or(false);
            if keep {
                predictions.push(prediction.clone());
            } else {
                dropped.insert((key, index));
            }
        }
        kept_count += predictions.len();
        survivors.push(ResultEntry {
            round: io.current_round,
            task: entry.task,
            source: entry.source,
            predictions,
        });
    }

    for entry in survivors {
        io.insert_result(entry);
    }

    for record in io.sub_images.values_mut() {
        let from_dropped = record
            .generated_by
            .map(|p| dropped.contains(&(p.result, p.index)))
            .unwrap_or(false);
        if record.is_active() && from_dropped {
            record.status = RecordStatus::Discarded;
        }
    }

    info!(
        "Area filter ({:?} {}) kept {} predictions, dropped {}",
        config.filter_mode,
        config.area_threshold,
        kept_count,
        dropped.len()
    );
}

/// One synthetic full-frame prediction per resized image.
pub fn record_ratio_adjust(io: &mut PipelineIO) {
    let entries: Vec<ResultEntry> = io
        .pending_resizes
        .iter()
        .filter_map(|pending| {
            let record = io.sub_images.get(&pending.source)?;
            let (w, h) = pending.size;
            let local = BBox::new(0.0, 0.0, w as f64, h as f64);
            let global = record
                .frame
                .with_scale(pending.ratio.0, pending.ratio.1)
                .map_box(&local);
            Some(ResultEntry {
                round: io.current_round,
                task: ResultTask::RatioAdjust,
                source: pending.source,
                predictions: vec![Prediction {
                    category_id: 0,
                    category_name: format!("adjusted_image_{}", pending.source.slot),
                    score: 1.0,
                    area: Some(local.area()),
                    bbox: Some(BoxShape::Axis(local)),
                    mask: None,
                    angle: None,
                    meta: PredictionMeta {
                        global_bbox: Some(global),
                        is_rotated: global.is_rotated(),
                        ..base_meta(record)
                    },
                }],
            })
        })
        .collect();

    for entry in entries {
        io.insert_result(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::AreaFilterMode;
    use crate::pipeline::types::{LocalFrame, Point, Provenance, MEMORY_IMAGE};
    use image::DynamicImage;
    use std::f64::consts::FRAC_PI_2;
    use std::sync::Arc;

    fn tile(x: f64, y: f64, w: u32, h: u32) -> SubImageRecord {
        SubImageRecord::root(
            MEMORY_IMAGE,
            Arc::new(DynamicImage::new_rgb8(w, h)),
            LocalFrame::at(x, y),
            (0, 1),
            0,
        )
    }

    fn raw(name: &str, score: f32, bbox: Option<[f64; 4]>) -> RawPrediction {
        RawPrediction {
            category_id: 1,
            category_name: name.to_string(),
            score,
            bbox,
            ..RawPrediction::default()
        }
    }

    #[test]
    fn test_detect_maps_to_global() {
        let record = tile(336.0, 0.0, 400, 400);
        let preds = detect(
            &record,
            vec![raw("dot", 0.7, Some([4.0, 100.0, 50.0, 50.0]))],
            &TaskConfig::default(),
        );
        assert_eq!(preds.len(), 1);
        assert_eq!(
            preds[0].meta.global_bbox,
            Some(BoxShape::Axis(BBox::new(340.0, 100.0, 50.0, 50.0)))
        );
        assert_eq!(preds[0].meta.tile_offset, Point { x: 336.0, y: 0.0 });
        assert_eq!(preds[0].meta.slice_index, Some((0, 1)));
    }

    #[test]
    fn test_detect_threshold_filter_and_expand() {
        let record = tile(0.0, 0.0, 100, 100);
        let config = TaskConfig {
            threshold: 0.5,
            category_filter_list: vec!["noise".into()],
            bbox_expand_pixels: 5,
            ..TaskConfig::default()
        };
        let preds = detect(
            &record,
            vec![
                raw("dot", 0.4, Some([10.0, 10.0, 10.0, 10.0])),
                raw("noise", 0.9, Some([10.0, 10.0, 10.0, 10.0])),
                raw("dot", 0.8, Some([2.0, 90.0, 10.0, 8.0])),
                raw("dot", 0.8, None),
            ],
            &config,
        );
        assert_eq!(preds.len(), 1);
        assert_eq!(
            preds[0].bbox,
            Some(BoxShape::Axis(BBox::new(0.0, 85.0, 17.0, 15.0)))
        );
    }

    #[test]
    fn test_expanded_box_keeps_mask_aligned() {
        let record = tile(0.0, 0.0, 100, 100);
        let config = TaskConfig {
            bbox_expand_pixels: 5,
            ..TaskConfig::default()
        };
        let mut r = raw("dot", 0.9, Some([10.0, 10.0, 10.0, 10.0]));
        r.mask = Some(GrayImage::from_pixel(10, 10, image::Luma([255])));
        let preds = detect(&record, vec![r], &config);

        assert_eq!(preds[0].bbox, Some(BoxShape::Axis(BBox::new(5.0, 5.0, 20.0, 20.0))));
        let mask = preds[0].mask.as_ref().unwrap();
        assert_eq!(mask.dimensions(), (20, 20));
        assert_eq!(mask.get_pixel(4, 4).0, [0]);
        assert_eq!(mask.get_pixel(5, 5).0, [255]);
        assert_eq!(mask.get_pixel(14, 14).0, [255]);
        assert_eq!(mask.get_pixel(15, 15).0, [0]);
    }

    #[test]
    fn test_expansion_clamped_at_edge_keeps_mask_aligned() {
        let record = tile(0.0, 0.0, 100, 100);
        let config = TaskConfig {
            bbox_expand_pixels: 5,
            ..TaskConfig::default()
        };
        let mut r = raw("dot", 0.9, Some([2.0, 90.0, 10.0, 8.0]));
        r.mask = Some(GrayImage::from_pixel(10, 8, image::Luma([255])));
        let preds = detect(&record, vec![r], &config);

        assert_eq!(preds[0].bbox, Some(BoxShape::Axis(BBox::new(0.0, 85.0, 17.0, 15.0))));
        let mask = preds[0].mask.as_ref().unwrap();
        assert_eq!(mask.dimensions(), (17, 15));
        assert_eq!(mask.get_pixel(1, 4).0, [0]);
        assert_eq!(mask.get_pixel(2, 5).0, [255]);
        assert_eq!(mask.get_pixel(11, 12).0, [255]);
        assert_eq!(mask.get_pixel(12, 12).0, [0]);
    }

    #[test]
    fn test_classify_top_k() {
        let record = tile(20.0, 30.0, 40, 50);
        let config = TaskConfig {
            task: TaskKind::Classification,
            threshold: 0.1,
            top_k: 2,
            ..TaskConfig::default()
        };
        let preds = classify(
            &record,
            vec![raw("a", 0.2, None), raw("b", 0.9, None), raw("c", 0.5, None), raw("d", 0.05, None)],
            &config,
        );
        let names: Vec<&str> = preds.iter().map(|p| p.category_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(preds[0].bbox.is_none());
        assert_eq!(
            preds[0].meta.global_bbox,
            Some(BoxShape::Axis(BBox::new(20.0, 30.0, 40.0, 50.0)))
        );
    }

    #[test]
    fn test_detect_rotated_centre() {
        let record = tile(100.0, 200.0, 64, 64);
        let mut r = raw("part", 0.9, Some([10.0, 20.0, 30.0, 10.0]));
        r.angle = Some(FRAC_PI_2);
        let preds = detect_rotated(&record, vec![r], &TaskConfig::default());
        match preds[0].meta.global_bbox {
            Some(BoxShape::Rotated(g)) => {
                assert_eq!((g.cx, g.cy, g.w, g.h), (110.0, 220.0, 30.0, 10.0));
                assert_eq!(g.angle, FRAC_PI_2);
            }
            other => panic!("expected rotated, got {:?}", other),
        }
        assert!(preds[0].meta.is_rotated);
    }

    #[test]
    fn test_rotated_centre_translated_by_tile_offset() {
        let record = tile(100.0, 200.0, 64, 64);
        let mut r = raw("part", 0.9, Some([30.0, 20.0, 20.0, 10.0]));
        r.angle = Some(0.5);
        let preds = detect_rotated(&record, vec![r], &TaskConfig::default());

        assert_eq!(
            preds[0].bbox,
            Some(BoxShape::Rotated(RotatedRect { cx: 30.0, cy: 20.0, w: 20.0, h: 10.0, angle: 0.5 }))
        );
        match preds[0].meta.global_bbox {
            Some(BoxShape::Rotated(g)) => {
                assert_eq!((g.cx, g.cy), (130.0, 220.0));
                assert_eq!((g.w, g.h, g.angle), (20.0, 10.0, 0.5));
            }
            other => panic!("expected rotated, got {:?}", other),
        }
    }

    #[test]
    fn test_area_filter_discards_crops() {
        let mut io = PipelineIO::new(DynamicImage::new_rgb8(200, 200), MEMORY_IMAGE);
        let source = io.insert_sub_image(tile(0.0, 0.0, 200, 200));
        io.current_round = 1;
        let record = io.sub_images[&source].clone();
        let preds = detect(
            &record,
            vec![
                raw("big", 0.9, Some([0.0, 0.0, 50.0, 50.0])),
                raw("small", 0.9, Some([100.0, 100.0, 10.0, 10.0])),
            ],
            &TaskConfig::default(),
        );
        let result_key = io.insert_result(ResultEntry {
            round: 1,
            task: ResultTask::Model(TaskKind::Detection),
            source,
            predictions: preds,
        });
        io.set_status(source, RecordStatus::Consumed);

        for index in 0..2 {
            let mut crop = tile(0.0, 0.0, 10, 10);
            crop.round = 1;
            crop.generated_by = Some(Provenance { result: result_key, index });
            io.insert_sub_image(crop);
        }

        io.current_round = 2;
        filter_by_area(
            &mut io,
            &AreaFilterConfig {
                area_threshold: 1000.0,
                filter_mode: AreaFilterMode::Greater,
            },
        );

        let keys = io.result_keys_in_round(2);
        assert_eq!(keys.len(), 1);
        let names: Vec<&str> = io.results[&keys[0]]
            .predictions
            .iter()
            .map(|p| p.category_name.as_str())
            .collect();
        assert_eq!(names, vec!["big"]);
        assert_eq!(io.sub_images[&SlotKey::new(1, 0)].status, RecordStatus::Active);
        assert_eq!(io.sub_images[&SlotKey::new(1, 1)].status, RecordStatus::Discarded);
    }
}
