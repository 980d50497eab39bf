use crate::error::InferenceError;
use crate::pipeline::types::TaskConfig;
use image::{DynamicImage, GrayImage};

/// One detection or classification as reported by a backend, in the coordinates of
/// the image it was given.
#[derive(Debug, Clone, Default)]
pub struct RawPrediction {
    pub category_id: i64,
    pub category_name: String,
    pub score: f32,
    /// `[x, y, w, h]`, or `[cx, cy, w, h]` for rotated detection; absent for classification
    pub bbox: Option<[f64; 4]>,
    pub mask: Option<GrayImage>,
    /// Radians, rotated detection only
    pub angle: Option<f64>,
    pub area: Option<f64>,
}

/// Anything that can run a model over a pixel buffer.
pub trait InferenceBackend: Send {
    fn name(&self) -> &str;

    fn infer(
        &mut self,
        image: &DynamicImage,
        config: &TaskConfig,
    ) -> Result<Vec<RawPrediction>, InferenceError>;

    /// One result per image, in input order.
    fn infer_batch(
        &mut self,
        images: &[&DynamicImage],
        config: &TaskConfig,
    ) -> Vec<Result<Vec<RawPrediction>, InferenceError>> {
        images.iter().map(|image| self.infer(image, config)).collect()
    }
}

/// Backend used when no model runtime is compiled in. Every call fails.
#[derive(Debug, Default)]
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl InferenceBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn infer(
        &mut self,
        _image: &DynamicImage,
        _config: &TaskConfig,
    ) -> Result<Vec<RawPrediction>, InferenceError> {
        Err(InferenceError::Unavailable(self.reason.clone()))
    }
}

/// Resolve a backend by name (`rtdetr`, `none`).
pub fn backend_from_name(name: &str) -> Box<dyn InferenceBackend> {
    match name {
        "rtdetr" => rtdetr_backend(),
        other => Box::new(UnavailableBackend::new(format!(
            "no backend named `{}`",
            other
        ))),
    }
}

#[cfg(feature = "rtdetr")]
fn rtdetr_backend() -> Box<dyn InferenceBackend> {
    Box::new(crate::pipeline::detection::RtDetrBackend::default())
}

#[cfg(not(feature = "rtdetr"))]
fn rtdetr_backend() -> Box<dyn InferenceBackend> {
    Box::new(UnavailableBackend::new("built without the `rtdetr` feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_backend_fails_every_call() {
        let mut backend = UnavailableBackend::new("offline");
        let image = DynamicImage::new_rgb8(4, 4);
        let results = backend.infer_batch(&[&image, &image], &TaskConfig::default());
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(matches!(result, Err(InferenceError::Unavailable(ref r)) if r == "offline"));
        }
    }

    #[test]
    fn test_unknown_backend_name() {
        let backend = backend_from_name("nope");
        assert_eq!(backend.name(), "unavailable");
    }
}
