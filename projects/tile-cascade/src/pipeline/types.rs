use crate::error::InferenceError;
use crate::pipeline::backend::RawPrediction;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Provenance marker for images that did not come from a file.
pub const MEMORY_IMAGE: &str = "memory_image";

/// A 2D point in pixel coordinates
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned box as (x, y, w, h)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.h
    }
}

/// Rotated rectangle: centre, size and angle in radians
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
    pub angle: f64,
}

impl RotatedRect {
    pub fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }
}

/// A box in either representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxShape {
    Axis(BBox),
    Rotated(RotatedRect),
}

impl BoxShape {
    pub fn area(&self) -> f64 {
        match self {
            BoxShape::Axis(b) => b.area(),
            BoxShape::Rotated(r) => r.area(),
        }
    }

    pub fn is_rotated(&self) -> bool {
        matches!(self, BoxShape::Rotated(_))
    }

    /// `[x, y, w, h]` or `[cx, cy, w, h, angle]`
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            BoxShape::Axis(b) => vec![b.x, b.y, b.w, b.h],
            BoxShape::Rotated(r) => vec![r.cx, r.cy, r.w, r.h, r.angle],
        }
    }
}

/// Placement of a sub-image inside the original image.
///
/// A local pixel `(u, v)` maps to `origin + R(angle) * (u / sx, v / sy)`. Tiles and
/// axis-aligned crops have `angle == 0` and unit scale, so mapping is a plain offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    pub origin: Point,
    pub scale: (f64, f64),
    pub angle: f64,
}

impl LocalFrame {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            origin: Point { x, y },
            scale: (1.0, 1.0),
            angle: 0.0,
        }
    }

    pub fn rotated(origin: Point, angle: f64) -> Self {
        Self {
            origin,
            scale: (1.0, 1.0),
            angle,
        }
    }

    /// Compose an extra resize on top of this frame.
    pub fn with_scale(mut self, sx: f64, sy: f64) -> Self {
        self.scale = (self.scale.0 * sx, self.scale.1 * sy);
        self
    }

    pub fn is_rotated(&self) -> bool {
        self.angle.abs() > f64::EPSILON
    }

    pub fn map_point(&self, u: f64, v: f64) -> Point {
        let lx = u / self.scale.0;
        let ly = v / self.scale.1;
        if !self.is_rotated() {
            return Point {
                x: self.origin.x + lx,
                y: self.origin.y + ly,
            };
        }
        let (s, c) = self.angle.sin_cos();
        Point {
            x: self.origin.x + lx * c - ly * s,
            y: self.origin.y + lx * s + ly * c,
        }
    }

    /// Map a local axis-aligned box to global coordinates. Inside a rotated crop the
    /// result is a rotated box sharing the crop's angle.
    pub fn map_box(&self, local: &BBox) -> BoxShape {
        let w = local.w / self.scale.0;
        let h = local.h / self.scale.1;
        if !self.is_rotated() {
            let p = self.map_point(local.x, local.y);
            return BoxShape::Axis(BBox::new(p.x, p.y, w, h));
        }
        let c = self.map_point(local.x + local.w / 2.0, local.y + local.h / 2.0);
        BoxShape::Rotated(RotatedRect {
            cx: c.x,
            cy: c.y,
            w,
            h,
            angle: self.angle,
        })
    }

    pub fn map_rotated(&self, local: &RotatedRect) -> RotatedRect {
        let c = self.map_point(local.cx, local.cy);
        RotatedRect {
            cx: c.x,
            cy: c.y,
            w: local.w / self.scale.0,
            h: local.h / self.scale.1,
            angle: local.angle + self.angle,
        }
    }
}

/// Arena index shared by sub-images and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub round: usize,
    pub slot: usize,
}

impl SlotKey {
    pub fn new(round: usize, slot: usize) -> Self {
        Self { round, slot }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.round, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Consumed,
    Discarded,
}

/// Which prediction produced a sub-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub result: SlotKey,
    pub index: usize,
}

/// One tile or crop produced during a run.
#[derive(Debug, Clone)]
pub struct SubImageRecord {
    pub origin_path: String,
    pub parent: Option<SlotKey>,
    pub frame: LocalFrame,
    pub slice_position: Option<(usize, usize)>,
    pub width: u32,
    pub height: u32,
    pub image: Arc<DynamicImage>,
    pub round: usize,
    pub status: RecordStatus,
    pub generated_by: Option<Provenance>,
    pub rotated_rect: Option<RotatedRect>,
}

impl SubImageRecord {
    /// A fresh, parentless record (tiles and the single-image source).
    pub fn root(
        origin_path: &str,
        image: Arc<DynamicImage>,
        frame: LocalFrame,
        slice_position: (usize, usize),
        round: usize,
    ) -> Self {
        Self {
            origin_path: origin_path.to_string(),
            parent: None,
            frame,
            slice_position: Some(slice_position),
            width: image.width(),
            height: image.height(),
            image,
            round,
            status: RecordStatus::Active,
            generated_by: None,
            rotated_rect: None,
        }
    }

    pub fn global_offset(&self) -> Point {
        self.frame.origin
    }

    pub fn is_rotated(&self) -> bool {
        self.rotated_rect.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }

    /// The record's own region expressed in global coordinates.
    pub fn global_region(&self) -> BoxShape {
        self.frame
            .map_box(&BBox::new(0.0, 0.0, self.width as f64, self.height as f64))
    }
}

/// Kind of model task an inference module runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskKind {
    #[serde(rename = "cls", alias = "classification", alias = "分类", alias = "图像分类")]
    Classification,
    #[serde(rename = "ocr", alias = "OCR")]
    Ocr,
    #[default]
    #[serde(rename = "det", alias = "detection")]
    Detection,
    #[serde(rename = "seg", alias = "instance_segmentation", alias = "实例分割")]
    InstanceSegmentation,
    #[serde(rename = "rotated_det", alias = "rotated_detection", alias = "旋转框检测")]
    RotatedDetection,
}

impl TaskKind {
    pub fn is_classification_like(&self) -> bool {
        matches!(self, TaskKind::Classification | TaskKind::Ocr)
    }

    pub fn is_rotated(&self) -> bool {
        matches!(self, TaskKind::RotatedDetection)
    }

    /// Tasks whose predictions take part in cross-tile combination.
    pub fn is_combinable(&self) -> bool {
        matches!(
            self,
            TaskKind::Detection | TaskKind::InstanceSegmentation | TaskKind::RotatedDetection
        )
    }
}

/// Task tag of a result entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTask {
    Model(TaskKind),
    RatioAdjust,
}

impl ResultTask {
    pub fn is_combinable(&self) -> bool {
        matches!(self, ResultTask::Model(task) if task.is_combinable())
    }
}

/// Task configuration in effect for the current round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    #[serde(rename = "task_type")]
    pub task: TaskKind,
    pub model_path: Option<String>,
    pub threshold: f32,
    pub iou_threshold: f32,
    #[serde(alias = "combine_ios_threshold")]
    pub combine_iou_threshold: f64,
    pub top_k: usize,
    /// Category names to drop from results
    pub category_filter_list: Vec<String>,
    pub bbox_expand_pixels: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            task: TaskKind::Detection,
            model_path: None,
            threshold: 0.5,
            iou_threshold: 0.2,
            combine_iou_threshold: 0.2,
            top_k: 1,
            category_filter_list: Vec::new(),
            bbox_expand_pixels: 0,
        }
    }
}

impl TaskConfig {
    pub fn keeps_category(&self, name: &str) -> bool {
        !self.category_filter_list.iter().any(|c| c == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictionMeta {
    pub combine_suppressed: bool,
    pub tile_offset: Point,
    pub slice_index: Option<(usize, usize)>,
    pub global_bbox: Option<BoxShape>,
    pub is_rotated: bool,
}

/// One detection or classification instance.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub category_id: i64,
    pub category_name: String,
    pub score: f32,
    pub area: Option<f64>,
    /// Local (sub-image) coordinates
    pub bbox: Option<BoxShape>,
    pub mask: Option<GrayImage>,
    pub angle: Option<f64>,
    pub meta: PredictionMeta,
}

impl Prediction {
    pub fn is_suppressed(&self) -> bool {
        self.meta.combine_suppressed
    }

    /// Area used by the area filter: `w * h` of the local box.
    pub fn box_area(&self) -> Option<f64> {
        self.bbox.as_ref().map(BoxShape::area)
    }
}

/// All predictions one sub-image produced in one round.
#[derive(Debug, Clone)]
pub struct ResultEntry {
    pub round: usize,
    pub task: ResultTask,
    pub source: SlotKey,
    pub predictions: Vec<Prediction>,
}

/// Module kind that produced the most recent results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginatingModule {
    ModelInference(TaskKind),
    ImageRatioAdjust,
    BboxAreaFilter,
}

/// A resized copy waiting to become a next-round record.
#[derive(Debug, Clone)]
pub struct PendingResize {
    pub source: SlotKey,
    pub image: DynamicImage,
    pub size: (u32, u32),
    pub ratio: (f64, f64),
}

/// Backend output for one sub-image, waiting for its result processor.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub source: SlotKey,
    pub predictions: Vec<RawPrediction>,
}

#[derive(Debug, Clone)]
pub struct InferenceFailure {
    pub key: SlotKey,
    pub round: usize,
    pub error: InferenceError,
}

/// Mutable state threaded through every module of one run.
#[derive(Debug)]
pub struct PipelineIO {
    pub source: Arc<DynamicImage>,
    pub origin_path: String,
    pub sub_images: BTreeMap<SlotKey, SubImageRecord>,
    pub results: BTreeMap<SlotKey, ResultEntry>,
    pub current_round: usize,
    /// Zero until the orchestrator sets it
    pub total_round: usize,
    pub active_config: TaskConfig,
    pub originating_module: Option<OriginatingModule>,
    pub pending_resizes: Vec<PendingResize>,
    pub raw_outputs: Vec<RawOutput>,
    pub failures: Vec<InferenceFailure>,
    pub cancelled: bool,
}

impl PipelineIO {
    pub fn new(image: DynamicImage, origin_path: impl Into<String>) -> Self {
        let source = match image {
            DynamicImage::ImageRgb8(_) => image,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };
        Self {
            source: Arc::new(source),
            origin_path: origin_path.into(),
            sub_images: BTreeMap::new(),
            results: BTreeMap::new(),
            current_round: 0,
            total_round: 0,
            active_config: TaskConfig::default(),
            originating_module: None,
            pending_resizes: Vec::new(),
            raw_outputs: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
        }
    }

    /// Keys of records not yet consumed, in key order.
    pub fn active_keys(&self) -> Vec<SlotKey> {
        self.sub_images
            .iter()
            .filter(|(_, r)| r.is_active())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Store a record under the next free slot of its round.
    pub fn insert_sub_image(&mut self, record: SubImageRecord) -> SlotKey {
        let slot = self
            .sub_images
            .range(SlotKey::new(record.round, 0)..=SlotKey::new(record.round, usize::MAX))
            .count();
        let key = SlotKey::new(record.round, slot);
        self.sub_images.insert(key, record);
        key
    }

    /// Store an entry under the next free slot of its round.
    pub fn insert_result(&mut self, entry: ResultEntry) -> SlotKey {
        let slot = self
            .results
            .range(SlotKey::new(entry.round, 0)..=SlotKey::new(entry.round, usize::MAX))
            .count();
        let key = SlotKey::new(entry.round, slot);
        self.results.insert(key, entry);
        key
    }

    pub fn set_status(&mut self, key: SlotKey, status: RecordStatus) {
        if let Some(record) = self.sub_images.get_mut(&key) {
            record.status = status;
        }
    }

    pub fn latest_result_round(&self) -> Option<usize> {
        self.results.values().map(|e| e.round).max()
    }

    pub fn result_keys_in_round(&self, round: usize) -> Vec<SlotKey> {
        self.results
            .iter()
            .filter(|(_, e)| e.round == round)
            .map(|(k, _)| *k)
            .collect()
    }

    /// True when the current round is the last configured one.
    pub fn is_terminal_round(&self) -> bool {
        self.current_round + 1 >= self.total_round
    }
}
