use crate::error::ConfigError;
use crate::pipeline::types::{BBox, LocalFrame, PipelineIO, SubImageRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Configuration for sliding window tiling
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    #[serde(alias = "tile_width")]
    pub small_img_width: u32,
    #[serde(alias = "tile_height")]
    pub small_img_height: u32,
    /// Overlap between neighbouring tiles, in pixels
    pub horizontal_overlap: u32,
    pub vertical_overlap: u32,
    /// Fractional overlap; overrides the pixel overlaps when set
    pub overlap_ratio: Option<f64>,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            small_img_width: 640,
            small_img_height: 640,
            horizontal_overlap: 64,
            vertical_overlap: 64,
            overlap_ratio: None,
        }
    }
}

impl SliceConfig {
    pub fn new(tile: u32, overlap: u32) -> Self {
        Self {
            small_img_width: tile,
            small_img_height: tile,
            horizontal_overlap: overlap,
            vertical_overlap: overlap,
            overlap_ratio: None,
        }
    }

    /// Effective `(horizontal, vertical)` overlap in pixels
    pub fn overlaps(&self) -> (u32, u32) {
        match self.overlap_ratio {
            Some(ratio) => (
                (self.small_img_width as f64 * ratio).round() as u32,
                (self.small_img_height as f64 * ratio).round() as u32,
            ),
            None => (self.horizontal_overlap, self.vertical_overlap),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.small_img_width == 0 || self.small_img_height == 0 {
            return Err(ConfigError::InvalidGeometry(format!(
                "tile size must be positive, got {}x{}",
                self.small_img_width, self.small_img_height
            )));
        }
        if let Some(ratio) = self.overlap_ratio {
            if !(0.0..1.0).contains(&ratio) {
                return Err(ConfigError::InvalidGeometry(format!(
                    "overlap_ratio must be in [0, 1), got {}",
                    ratio
                )));
            }
        }
        let (ox, oy) = self.overlaps();
        if ox >= self.small_img_width || oy >= self.small_img_height {
            return Err(ConfigError::InvalidGeometry(format!(
                "overlap {}x{} must be smaller than tile {}x{}",
                ox, oy, self.small_img_width, self.small_img_height
            )));
        }
        Ok(())
    }

    /// Tile rectangles in row-major order, each with its `(row, col)`.
    pub fn tiles(&self, img_w: u32, img_h: u32) -> Vec<((usize, usize), BBox)> {
        let (ox, oy) = self.overlaps();
        let xs = generate_offsets(img_w, self.small_img_width, ox);
        let ys = generate_offsets(img_h, self.small_img_height, oy);

        let mut tiles = Vec::with_capacity(xs.len() * ys.len());
        for (row, &(y, h)) in ys.iter().enumerate() {
            for (col, &(x, w)) in xs.iter().enumerate() {
                tiles.push((
                    (row, col),
                    BBox::new(x as f64, y as f64, w as f64, h as f64),
                ));
            }
        }
        tiles
    }
}

/// Tile `(offset, length)` pairs along one axis. Edge tiles are shifted back so they
/// end on the image border; a tile larger than the image is clipped to it.
pub fn generate_offsets(total: u32, tile: u32, overlap: u32) -> Vec<(u32, u32)> {
    if total == 0 {
        return vec![];
    }
    if tile >= total {
        return vec![(0, total)];
    }

    let stride = tile.saturating_sub(overlap).max(1);
    let limit = total - tile;
    let count = limit.div_ceil(stride) + 1;

    let mut offsets: Vec<u32> = (0..count).map(|i| (i * stride).min(limit)).collect();
    offsets.dedup();
    offsets.into_iter().map(|o| (o, tile)).collect()
}

/// Round-0 generator covering the image with overlapping tiles.
#[derive(Clone, Debug)]
pub struct TilingGenerator {
    pub config: SliceConfig,
}

impl TilingGenerator {
    pub fn new(config: SliceConfig) -> Self {
        Self { config }
    }

    pub fn process(&self, io: &mut PipelineIO) {
        let (img_w, img_h) = (io.source.width(), io.source.height());
        let tiles = self.config.tiles(img_w, img_h);

        for (position, rect) in &tiles {
            let tile = io.source.crop_imm(
                rect.x as u32,
                rect.y as u32,
                rect.w as u32,
                rect.h as u32,
            );
            let record = SubImageRecord::root(
                &io.origin_path,
                Arc::new(tile),
                LocalFrame::at(rect.x, rect.y),
                *position,
                io.current_round,
            );
            io.insert_sub_image(record);
        }

        info!(
            "Tiled {}x{} image into {} tiles ({}x{})",
            img_w,
            img_h,
            tiles.len(),
            self.config.small_img_width,
            self.config.small_img_height
        );
    }
}

/// Round-0 generator passing the whole image through as one record.
#[derive(Clone, Debug, Default)]
pub struct SingleImageGenerator;

impl SingleImageGenerator {
    pub fn process(&self, io: &mut PipelineIO) {
        let record = SubImageRecord::root(
            &io.origin_path,
            io.source.clone(),
            LocalFrame::at(0.0, 0.0),
            (0, 0),
            io.current_round,
        );
        io.insert_sub_image(record);
    }
}
