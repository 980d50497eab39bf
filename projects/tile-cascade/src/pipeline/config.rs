use crate::error::ConfigError;
use crate::pipeline::slicing::SliceConfig;
use crate::pipeline::types::{TaskConfig, TaskKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Settings of a `model_inference` descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InferenceConfig {
    #[serde(flatten)]
    pub task: TaskConfig,
    /// Set by the descriptor rewrite when the following result and combine
    /// modules were folded into this one
    #[serde(default)]
    pub auto_process_results: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioAdjustConfig {
    pub horizontal_ratio: f64,
    pub vertical_ratio: f64,
}

impl Default for RatioAdjustConfig {
    fn default() -> Self {
        Self {
            horizontal_ratio: 1.0,
            vertical_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AreaFilterMode {
    /// Keep boxes with area above the threshold
    #[default]
    Greater,
    Less,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaFilterConfig {
    pub area_threshold: f64,
    pub filter_mode: AreaFilterMode,
}

impl Default for AreaFilterConfig {
    fn default() -> Self {
        Self {
            area_threshold: 1000.0,
            filter_mode: AreaFilterMode::Greater,
        }
    }
}

impl AreaFilterConfig {
    pub fn keeps(&self, area: f64) -> bool {
        match self.filter_mode {
            AreaFilterMode::Greater => area > self.area_threshold,
            AreaFilterMode::Less => area < self.area_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CombineConfig {
    #[serde(alias = "combine_ios_threshold", alias = "iou_threshold")]
    pub combine_iou_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SaveImageConfig {
    pub save_path: Option<PathBuf>,
}

/// One entry of a declarative module list.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleDescriptor {
    SlidingWindow(SliceConfig),
    SingleImage,
    ModelInference(InferenceConfig),
    ImageRatioAdjust(RatioAdjustConfig),
    BboxAreaFilter(AreaFilterConfig),
    ClassificationResult,
    DetectionResult,
    RotatedDetectionResult,
    CombineResults(CombineConfig),
    Visualization,
    SaveImage(SaveImageConfig),
    Pipeline(Vec<ModuleDescriptor>),
}

fn parse_fields<T: DeserializeOwned>(module: &str, value: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidDescriptor {
        module: module.to_string(),
        source,
    })
}

impl ModuleDescriptor {
    pub fn module_type(&self) -> &'static str {
        match self {
            ModuleDescriptor::SlidingWindow(_) => "sliding_window",
            ModuleDescriptor::SingleImage => "single_image",
            ModuleDescriptor::ModelInference(_) => "model_inference",
            ModuleDescriptor::ImageRatioAdjust(_) => "image_ratio_adjust",
            ModuleDescriptor::BboxAreaFilter(_) => "bbox_area_filter",
            ModuleDescriptor::ClassificationResult => "classification_result",
            ModuleDescriptor::DetectionResult => "detection_result",
            ModuleDescriptor::RotatedDetectionResult => "rotated_detection_result",
            ModuleDescriptor::CombineResults(_) => "combine_results",
            ModuleDescriptor::Visualization => "visualization",
            ModuleDescriptor::SaveImage(_) => "save_image",
            ModuleDescriptor::Pipeline(_) => "pipeline",
        }
    }

    pub fn is_image_source(&self) -> bool {
        matches!(
            self,
            ModuleDescriptor::SlidingWindow(_) | ModuleDescriptor::SingleImage
        )
    }

    /// Parse one descriptor object, dispatching on its `module_type`.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let module_type = value
            .get("module_type")
            .and_then(Value::as_str)
            .ok_or(ConfigError::MissingModuleType)?;

        let descriptor = match module_type {
            "sliding_window" => ModuleDescriptor::SlidingWindow(parse_fields(module_type, value)?),
            "single_image" => ModuleDescriptor::SingleImage,
            "model_inference" => ModuleDescriptor::ModelInference(parse_fields(module_type, value)?),
            "image_ratio_adjust" => {
                ModuleDescriptor::ImageRatioAdjust(parse_fields(module_type, value)?)
            }
            "bbox_area_filter" => ModuleDescriptor::BboxAreaFilter(parse_fields(module_type, value)?),
            "classification_result" => ModuleDescriptor::ClassificationResult,
            "detection_result" => ModuleDescriptor::DetectionResult,
            "rotated_detection_result" => ModuleDescriptor::RotatedDetectionResult,
            "combine_results" => ModuleDescriptor::CombineResults(parse_fields(module_type, value)?),
            "visualization" => ModuleDescriptor::Visualization,
            "save_image" => ModuleDescriptor::SaveImage(parse_fields(module_type, value)?),
            "pipeline" => {
                let children = value.get("modules").ok_or(ConfigError::MissingField {
                    module: "pipeline",
                    field: "modules",
                })?;
                ModuleDescriptor::Pipeline(parse_descriptors(children)?)
            }
            other => return Err(ConfigError::UnknownModuleType(other.to_string())),
        };
        Ok(descriptor)
    }
}

/// Parse a descriptor list: either a JSON array or an object with a `modules` array.
pub fn parse_descriptors(value: &Value) -> Result<Vec<ModuleDescriptor>, ConfigError> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("modules") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ConfigError::MissingField {
                    module: "pipeline",
                    field: "modules",
                })
            }
        },
        _ => return Err(ConfigError::EmptyModuleList),
    };
    list.iter().map(ModuleDescriptor::from_value).collect()
}

/// Prepend a `single_image` generator unless the list already starts with one.
pub fn ensure_image_source(mut descriptors: Vec<ModuleDescriptor>) -> Vec<ModuleDescriptor> {
    let has_source = descriptors
        .first()
        .map(ModuleDescriptor::is_image_source)
        .unwrap_or(false);
    if !has_source {
        descriptors.insert(0, ModuleDescriptor::SingleImage);
    }
    descriptors
}

fn result_matches_task(descriptor: &ModuleDescriptor, task: TaskKind) -> bool {
    match descriptor {
        ModuleDescriptor::ClassificationResult => task.is_classification_like(),
        ModuleDescriptor::DetectionResult => !task.is_classification_like(),
        _ => false,
    }
}

/// If `descriptors[index]` starts a `[model_inference, matching result, combine_results]`
/// run, the combine threshold to fold into the inference module.
pub fn auto_process_pattern(descriptors: &[ModuleDescriptor], index: usize) -> Option<f64> {
    let ModuleDescriptor::ModelInference(inference) = descriptors.get(index)? else {
        return None;
    };
    let result = descriptors.get(index + 1)?;
    let ModuleDescriptor::CombineResults(combine) = descriptors.get(index + 2)? else {
        return None;
    };
    if !result_matches_task(result, inference.task.task) {
        return None;
    }
    Some(
        combine
            .combine_iou_threshold
            .unwrap_or(inference.task.combine_iou_threshold),
    )
}

/// Fold every `[model_inference, detection_result | classification_result, combine_results]`
/// run into a single `model_inference` with `auto_process_results` set. Recurses into
/// nested pipelines.
pub fn collapse_auto_process(descriptors: Vec<ModuleDescriptor>) -> Vec<ModuleDescriptor> {
    let mut out = Vec::with_capacity(descriptors.len());
    let mut i = 0;
    while i < descriptors.len() {
        if let Some(threshold) = auto_process_pattern(&descriptors, i) {
            if let ModuleDescriptor::ModelInference(inference) = &descriptors[i] {
                let mut folded = inference.clone();
                folded.auto_process_results = true;
                folded.task.combine_iou_threshold = threshold;
                out.push(ModuleDescriptor::ModelInference(folded));
                i += 3;
                continue;
            }
        }
        let next = match &descriptors[i] {
            ModuleDescriptor::Pipeline(children) => {
                ModuleDescriptor::Pipeline(collapse_auto_process(children.clone()))
            }
            other => other.clone(),
        };
        out.push(next);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_descriptors() {
        let value = json!([
            {"module_type": "sliding_window", "small_img_width": 400, "small_img_height": 300,
             "horizontal_overlap": 32, "vertical_overlap": 16},
            {"module_type": "model_inference", "model_path": "det.onnx", "task_type": "det",
             "threshold": 0.3, "combine_ios_threshold": 0.4, "category_filter_list": ["cat"]},
            {"module_type": "bbox_area_filter", "area_threshold": 50.0, "filter_mode": "less"},
            {"module_type": "pipeline", "modules": [{"module_type": "visualization"}]}
        ]);
        let descriptors = parse_descriptors(&value).unwrap();
        assert_eq!(descriptors.len(), 4);

        match &descriptors[0] {
            ModuleDescriptor::SlidingWindow(c) => {
                assert_eq!((c.small_img_width, c.small_img_height), (400, 300));
                assert_eq!(c.overlaps(), (32, 16));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &descriptors[1] {
            ModuleDescriptor::ModelInference(c) => {
                assert_eq!(c.task.model_path.as_deref(), Some("det.onnx"));
                assert_eq!(c.task.task, TaskKind::Detection);
                assert_eq!(c.task.threshold, 0.3);
                assert_eq!(c.task.combine_iou_threshold, 0.4);
                assert_eq!(c.task.top_k, 1);
                assert!(!c.task.keeps_category("cat"));
                assert!(!c.auto_process_results);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &descriptors[2] {
            ModuleDescriptor::BboxAreaFilter(c) => {
                assert_eq!(c.filter_mode, AreaFilterMode::Less);
                assert!(c.keeps(49.0));
                assert!(!c.keeps(50.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            descriptors[3],
            ModuleDescriptor::Pipeline(vec![ModuleDescriptor::Visualization])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ModuleDescriptor::from_value(&json!({"threshold": 0.5})),
            Err(ConfigError::MissingModuleType)
        ));
        assert!(matches!(
            ModuleDescriptor::from_value(&json!({"module_type": "teleport"})),
            Err(ConfigError::UnknownModuleType(ref t)) if t == "teleport"
        ));
        assert!(matches!(
            ModuleDescriptor::from_value(&json!({"module_type": "sliding_window", "small_img_width": "wide"})),
            Err(ConfigError::InvalidDescriptor { .. })
        ));
        assert!(matches!(
            ModuleDescriptor::from_value(&json!({"module_type": "pipeline"})),
            Err(ConfigError::MissingField { module: "pipeline", field: "modules" })
        ));
        assert!(matches!(
            ModuleDescriptor::from_value(&json!({"module_type": "model_inference", "task_type": "pose"})),
            Err(ConfigError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_ensure_image_source() {
        let with_source = ensure_image_source(vec![
            ModuleDescriptor::SlidingWindow(SliceConfig::default()),
            ModuleDescriptor::Visualization,
        ]);
        assert_eq!(with_source.len(), 2);

        let without = ensure_image_source(vec![ModuleDescriptor::Visualization]);
        assert_eq!(
            without,
            vec![ModuleDescriptor::SingleImage, ModuleDescriptor::Visualization]
        );
    }

    #[test]
    fn test_collapse_auto_process() {
        let inference = InferenceConfig {
            task: TaskConfig {
                model_path: Some("det.onnx".into()),
                ..TaskConfig::default()
            },
            auto_process_results: false,
        };
        let descriptors = vec![
            ModuleDescriptor::SlidingWindow(SliceConfig::default()),
            ModuleDescriptor::ModelInference(inference.clone()),
            ModuleDescriptor::DetectionResult,
            ModuleDescriptor::CombineResults(CombineConfig {
                combine_iou_threshold: Some(0.6),
            }),
            ModuleDescriptor::Pipeline(vec![
                ModuleDescriptor::ModelInference(inference.clone()),
                ModuleDescriptor::DetectionResult,
                ModuleDescriptor::CombineResults(CombineConfig::default()),
            ]),
        ];

        let collapsed = collapse_auto_process(descriptors);
        assert_eq!(collapsed.len(), 3);
        match &collapsed[1] {
            ModuleDescriptor::ModelInference(c) => {
                assert!(c.auto_process_results);
                assert_eq!(c.task.combine_iou_threshold, 0.6);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &collapsed[2] {
            ModuleDescriptor::Pipeline(children) => {
                assert_eq!(children.len(), 1);
                assert!(matches!(
                    &children[0],
                    ModuleDescriptor::ModelInference(c) if c.auto_process_results
                        && c.task.combine_iou_threshold == 0.2
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_collapse_requires_matching_result() {
        let classify = InferenceConfig {
            task: TaskConfig {
                task: TaskKind::Classification,
                model_path: Some("cls.onnx".into()),
                ..TaskConfig::default()
            },
            auto_process_results: false,
        };
        let descriptors = vec![
            ModuleDescriptor::ModelInference(classify),
            ModuleDescriptor::DetectionResult,
            ModuleDescriptor::CombineResults(CombineConfig::default()),
        ];
        assert_eq!(collapse_auto_process(descriptors.clone()), descriptors);
    }
}
