//! Deterministic backend for tests: finds the bounding box of bright pixels.

use crate::error::InferenceError;
use crate::pipeline::backend::{InferenceBackend, RawPrediction};
use crate::pipeline::types::TaskConfig;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

pub struct BlobBackend {
    /// Score for the n-th detection hit, cycling
    scores: Vec<f32>,
    hits: usize,
    calls: usize,
    fail_on_call: Option<usize>,
}

impl BlobBackend {
    pub fn new(scores: Vec<f32>) -> Self {
        Self {
            scores,
            hits: 0,
            calls: 0,
            fail_on_call: None,
        }
    }

    /// Fail the call with this zero-based index
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

fn bright_bounds(image: &DynamicImage) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in image.pixels() {
        let [r, g, b, _] = pixel.0;
        if (r as u32 + g as u32 + b as u32) / 3 <= 128 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds
}

impl InferenceBackend for BlobBackend {
    fn name(&self) -> &str {
        "blob"
    }

    fn infer(
        &mut self,
        image: &DynamicImage,
        config: &TaskConfig,
    ) -> Result<Vec<RawPrediction>, InferenceError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(InferenceError::Backend("injected failure".to_string()));
        }

        let bounds = bright_bounds(image);

        if config.task.is_classification_like() {
            let (bright, dark) = if bounds.is_some() { (0.95, 0.05) } else { (0.05, 0.95) };
            return Ok(vec![
                RawPrediction {
                    category_id: 1,
                    category_name: "bright".to_string(),
                    score: bright,
                    ..RawPrediction::default()
                },
                RawPrediction {
                    category_id: 0,
                    category_name: "dark".to_string(),
                    score: dark,
                    ..RawPrediction::default()
                },
            ]);
        }

        let Some((x0, y0, x1, y1)) = bounds else {
            return Ok(vec![]);
        };
        let score = self.scores[self.hits % self.scores.len()];
        self.hits += 1;

        let (w, h) = ((x1 - x0 + 1) as f64, (y1 - y0 + 1) as f64);
        let bbox = if config.task.is_rotated() {
            [x0 as f64 + w / 2.0, y0 as f64 + h / 2.0, w, h]
        } else {
            [x0 as f64, y0 as f64, w, h]
        };
        Ok(vec![RawPrediction {
            category_id: 0,
            category_name: "blob".to_string(),
            score,
            bbox: Some(bbox),
            mask: None,
            angle: config.task.is_rotated().then_some(0.0),
            area: Some(w * h),
        }])
    }
}

/// Black image with white rectangles at `(x, y, w, h)`
pub fn image_with_squares(width: u32, height: u32, squares: &[(u32, u32, u32, u32)]) -> DynamicImage {
    let mut image = RgbImage::new(width, height);
    for &(x, y, w, h) in squares {
        for py in y..(y + h).min(height) {
            for px in x..(x + w).min(width) {
                image.put_pixel(px, py, Rgb([255, 255, 255]));
            }
        }
    }
    DynamicImage::ImageRgb8(image)
}
