use crate::pipeline::geometry::{clamp_crop_region, crop_rotated, rotated_rect_to_quad};
use crate::pipeline::types::{
    BoxShape, LocalFrame, OriginatingModule, PendingResize, PipelineIO, Provenance, RecordStatus,
    ResultTask, SlotKey, SubImageRecord, TaskKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Expands the current round's surviving predictions into sub-images for the next round.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextRoundGenerator;

impl NextRoundGenerator {
    pub fn process(&self, io: &mut PipelineIO) {
        if io.is_terminal_round() {
            io.pending_resizes.clear();
            return;
        }

        let created = match io.originating_module {
            Some(OriginatingModule::ModelInference(task)) => from_predictions(io, task),
            Some(OriginatingModule::ImageRatioAdjust) => from_resizes(io),
            Some(OriginatingModule::BboxAreaFilter) | None => 0,
        };

        info!(
            "Round {}: generated {} sub-images for round {}",
            io.current_round,
            created,
            io.current_round + 1
        );
    }
}

fn child_record(parent: &SubImageRecord, round: usize, generated_by: Provenance) -> SubImageRecord {
    SubImageRecord {
        origin_path: parent.origin_path.clone(),
        parent: None,
        frame: parent.frame,
        slice_position: parent.slice_position,
        width: parent.width,
        height: parent.height,
        image: parent.image.clone(),
        round,
        status: RecordStatus::Active,
        generated_by: Some(generated_by),
        rotated_rect: parent.rotated_rect,
    }
}

/// Cut a global box out of the source image. `None` when the box has no pixels left.
fn crop_global(
    io: &PipelineIO,
    parent: &SubImageRecord,
    shape: &BoxShape,
    round: usize,
    generated_by: Provenance,
) -> Option<SubImageRecord> {
    let (image, frame, rotated_rect) = match shape {
        BoxShape::Axis(b) => {
            let (left, top, w, h) = clamp_crop_region(
                io.source.width(),
                io.source.height(),
                b.x,
                b.y,
                b.right(),
                b.bottom(),
            )?;
            (
                io.source.crop_imm(left, top, w, h),
                LocalFrame::at(left as f64, top as f64),
                None,
            )
        }
        BoxShape::Rotated(r) => {
            let image = crop_rotated(&io.source, r)?;
            let quad = rotated_rect_to_quad(r.cx, r.cy, r.w, r.h, r.angle);
            (image, LocalFrame::rotated(quad[0], r.angle), Some(*r))
        }
    };

    Some(SubImageRecord {
        origin_path: parent.origin_path.clone(),
        parent: None,
        frame,
        slice_position: parent.slice_position,
        width: image.width(),
        height: image.height(),
        image: Arc::new(image),
        round,
        status: RecordStatus::Active,
        generated_by: Some(generated_by),
        rotated_rect,
    })
}

fn from_predictions(io: &mut PipelineIO, task: TaskKind) -> usize {
    let round = io.current_round;
    let mut records = Vec::new();

    for key in io.result_keys_in_round(round) {
        let Some(entry) = io.results.get(&key) else {
            continue;
        };
        if entry.task != ResultTask::Model(task) {
            continue;
        }
        let Some(parent) = io.sub_images.get(&entry.source) else {
            continue;
        };

        for (index, prediction) in entry.predictions.iter().enumerate() {
            if prediction.is_suppressed() {
                continue;
            }
            let provenance = Provenance { result: key, index };

            let record = if task.is_classification_like() {
                Some(child_record(parent, round, provenance))
            } else {
                match prediction.meta.global_bbox {
                    Some(shape) => crop_global(io, parent, &shape, round, provenance),
                    None => None,
                }
            };

            match record {
                Some(mut record) => {
                    record.parent = Some(entry.source);
                    records.push(record);
                }
                None => debug!(
                    "Skipping prediction {} of result {}: empty crop",
                    index, key
                ),
            }
        }
    }

    let created = records.len();
    for record in records {
        io.insert_sub_image(record);
    }
    created
}

fn from_resizes(io: &mut PipelineIO) -> usize {
    let round = io.current_round;
    let mut pending: HashMap<SlotKey, PendingResize> = std::mem::take(&mut io.pending_resizes)
        .into_iter()
        .map(|p| (p.source, p))
        .collect();

    let mut records = Vec::new();
    for key in io.result_keys_in_round(round) {
        let Some(entry) = io.results.get(&key) else {
            continue;
        };
        if entry.task != ResultTask::RatioAdjust {
            continue;
        }
        let (Some(parent), Some(resize)) =
            (io.sub_images.get(&entry.source), pending.remove(&entry.source))
        else {
            continue;
        };

        let mut record = child_record(parent, round, Provenance { result: key, index: 0 });
        record.parent = Some(entry.source);
        record.frame = parent.frame.with_scale(resize.ratio.0, resize.ratio.1);
        record.width = resize.size.0;
        record.height = resize.size.1;
        record.image = Arc::new(resize.image);
        records.push(record);
    }

    let created = records.len();
    for record in records {
        io.insert_sub_image(record);
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{
        BBox, Prediction, PredictionMeta, ResultEntry, RotatedRect, MEMORY_IMAGE,
    };
    use image::{DynamicImage, Rgb, RgbImage};
    use std::f64::consts::FRAC_PI_2;

    fn io_with_detection(task: TaskKind, shapes: Vec<(BoxShape, bool)>) -> PipelineIO {
        let source = DynamicImage::ImageRgb8(RgbImage::from_fn(100, 100, |x, y| {
            Rgb([x as u8, y as u8, 0])
        }));
        let mut io = PipelineIO::new(source, MEMORY_IMAGE);
        let tile = SubImageRecord::root(
            MEMORY_IMAGE,
            io.source.clone(),
            LocalFrame::at(0.0, 0.0),
            (0, 0),
            0,
        );
        let source_key = io.insert_sub_image(tile);
        io.set_status(source_key, RecordStatus::Consumed);
        io.current_round = 1;
        io.total_round = 3;
        io.originating_module = Some(OriginatingModule::ModelInference(task));

        let predictions = shapes
            .into_iter()
            .map(|(shape, suppressed)| Prediction {
                category_id: 0,
                category_name: "part".into(),
                score: 0.9,
                area: Some(shape.area()),
                bbox: Some(shape),
                mask: None,
                angle: None,
                meta: PredictionMeta {
                    combine_suppressed: suppressed,
                    global_bbox: Some(shape),
                    ..PredictionMeta::default()
                },
            })
            .collect();
        io.insert_result(ResultEntry {
            round: 1,
            task: ResultTask::Model(task),
            source: source_key,
            predictions,
        });
        io
    }

    #[test]
    fn test_terminal_round_generates_nothing() {
        let mut io = io_with_detection(
            TaskKind::Detection,
            vec![(BoxShape::Axis(BBox::new(10.0, 10.0, 20.0, 20.0)), false)],
        );
        io.total_round = 2;
        NextRoundGenerator.process(&mut io);
        assert_eq!(io.sub_images.len(), 1);
    }

    #[test]
    fn test_crops_skip_suppressed() {
        let mut io = io_with_detection(
            TaskKind::Detection,
            vec![
                (BoxShape::Axis(BBox::new(10.5, 20.0, 20.0, 15.0)), false),
                (BoxShape::Axis(BBox::new(12.0, 20.0, 20.0, 15.0)), true),
                (BoxShape::Axis(BBox::new(150.0, 150.0, 10.0, 10.0)), false),
            ],
        );
        NextRoundGenerator.process(&mut io);

        assert_eq!(io.sub_images.len(), 2);
        let crop = &io.sub_images[&SlotKey::new(1, 0)];
        assert_eq!(crop.frame.origin.x, 10.0);
        assert_eq!(crop.frame.origin.y, 20.0);
        assert_eq!((crop.width, crop.height), (21, 15));
        assert_eq!(crop.image.to_rgb8().get_pixel(0, 0).0, [10, 20, 0]);
        assert_eq!(crop.parent, Some(SlotKey::new(0, 0)));
        assert_eq!(
            crop.generated_by,
            Some(Provenance { result: SlotKey::new(1, 0), index: 0 })
        );
    }

    #[test]
    fn test_rotated_crop_frame_starts_at_quad_corner() {
        let rect = RotatedRect { cx: 50.0, cy: 50.0, w: 20.0, h: 10.0, angle: FRAC_PI_2 };
        let mut io = io_with_detection(
            TaskKind::RotatedDetection,
            vec![(BoxShape::Rotated(rect), false)],
        );
        NextRoundGenerator.process(&mut io);

        let crop = &io.sub_images[&SlotKey::new(1, 0)];
        assert!(crop.is_rotated());
        assert_eq!((crop.width, crop.height), (20, 10));
        let origin = crop.frame.map_point(0.0, 0.0);
        assert!((origin.x - 55.0).abs() < 1e-9 && (origin.y - 40.0).abs() < 1e-9);
        assert_eq!(crop.image.to_rgb8().get_pixel(0, 0).0, [55, 40, 0]);
    }

    #[test]
    fn test_classification_children_share_buffer() {
        let mut io = io_with_detection(
            TaskKind::Classification,
            vec![(BoxShape::Axis(BBox::new(0.0, 0.0, 100.0, 100.0)), false)],
        );
        NextRoundGenerator.process(&mut io);

        let parent = &io.sub_images[&SlotKey::new(0, 0)];
        let child = &io.sub_images[&SlotKey::new(1, 0)];
        assert!(Arc::ptr_eq(&parent.image, &child.image));
        assert_eq!(child.frame, parent.frame);
    }

    #[test]
    fn test_area_filter_origin_generates_nothing() {
        let mut io = io_with_detection(
            TaskKind::Detection,
            vec![(BoxShape::Axis(BBox::new(10.0, 10.0, 20.0, 20.0)), false)],
        );
        io.originating_module = Some(OriginatingModule::BboxAreaFilter);
        NextRoundGenerator.process(&mut io);
        assert_eq!(io.sub_images.len(), 1);
    }
}
