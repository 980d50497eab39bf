use crate::error::InferenceError;
use crate::pipeline::backend::{InferenceBackend, RawPrediction};
use crate::pipeline::types::{TaskConfig, TaskKind};
use image::DynamicImage;
use std::collections::HashMap;
use tracing::info;
use usls::models::RTDETR;
use usls::{Config, Image};

/// RT-DETR through usls, one loaded model per `model_path`.
///
/// Corrects for the aspect-ratio padding bug in the underlying model library.
#[derive(Default)]
pub struct RtDetrBackend {
    models: HashMap<String, RTDETR>,
}

impl RtDetrBackend {
    fn model(&mut self, model_path: &str) -> Result<&mut RTDETR, InferenceError> {
        if !self.models.contains_key(model_path) {
            info!("Loading RT-DETR model from {}", model_path);
            let config = Config::default()
                .with_model_file(model_path)
                .with_class_names(&usls::NAMES_COCO_80);

            #[cfg(target_os = "macos")]
            let config = config.with_model_device(usls::Device::CoreMl);

            let config = config
                .commit()
                .map_err(|e| InferenceError::Backend(e.to_string()))?;
            let model = RTDETR::new(config).map_err(|e| InferenceError::Backend(e.to_string()))?;
            self.models.insert(model_path.to_string(), model);
        }
        self.models
            .get_mut(model_path)
            .ok_or_else(|| InferenceError::Backend(format!("model {} not loaded", model_path)))
    }
}

fn aspect_correction(image: &DynamicImage) -> (f32, f32) {
    let img_w = image.width() as f32;
    let img_h = image.height() as f32;
    if img_w > img_h {
        (img_w / img_h, 1.0)
    } else if img_h > img_w {
        (1.0, img_h / img_w)
    } else {
        (1.0, 1.0)
    }
}

impl InferenceBackend for RtDetrBackend {
    fn name(&self) -> &str {
        "rtdetr"
    }

    fn infer(
        &mut self,
        image: &DynamicImage,
        config: &TaskConfig,
    ) -> Result<Vec<RawPrediction>, InferenceError> {
        if !matches!(config.task, TaskKind::Detection) {
            return Err(InferenceError::UnsupportedTask(config.task));
        }
        let model_path = config
            .model_path
            .as_deref()
            .ok_or_else(|| InferenceError::Backend("no model_path configured".to_string()))?;

        let (x_corr, y_corr) = aspect_correction(image);
        let model = self.model(model_path)?;
        let results = model
            .forward(&[Image::from(image.clone())])
            .map_err(|e| InferenceError::Backend(e.to_string()))?;

        let Some(y) = results.into_iter().next() else {
            return Ok(vec![]);
        };

        Ok(y.hbbs
            .iter()
            .map(|hbb| {
                let w = (hbb.width() * x_corr) as f64;
                let h = (hbb.height() * y_corr) as f64;
                RawPrediction {
                    category_id: hbb.id().map(|id| id as i64).unwrap_or(-1),
                    category_name: hbb.name().unwrap_or_default().to_string(),
                    score: hbb.confidence().unwrap_or(0.0),
                    bbox: Some([
                        (hbb.xmin() * x_corr) as f64,
                        (hbb.ymin() * y_corr) as f64,
                        w,
                        h,
                    ]),
                    mask: None,
                    angle: None,
                    area: Some(w * h),
                }
            })
            .collect())
    }
}
