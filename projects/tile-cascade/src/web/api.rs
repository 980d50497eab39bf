use crate::error::PipelineError;
use crate::pipeline::config::parse_descriptors;
use crate::pipeline::finalize::PipelineResult;
use crate::pipeline::run::{load_image, predict_with_modules, PredictOptions};
use crate::run_context::{list_images, list_runs, store_run, RunMetadata};
use crate::web::server::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Serialize, Deserialize, Debug)]
pub struct ImageInfo {
    pub name: String,
    pub path: String,
}

#[derive(Serialize)]
pub struct RunInfo {
    pub name: String,
    pub metadata: RunMetadata,
}

#[derive(Deserialize, Debug)]
pub struct PredictRequest {
    /// Relative to the image root unless absolute
    pub image_path: String,
    pub modules: serde_json::Value,
    #[serde(default)]
    pub round: Option<usize>,
    #[serde(default)]
    pub tile_positions: bool,
}

pub async fn get_images(State(state): State<AppState>) -> Json<Vec<ImageInfo>> {
    let images = list_images(&state.image_root);

    let info_list = images
        .into_iter()
        .map(|image_path| {
            let name = image_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            let path = image_path
                .strip_prefix(&state.image_root)
                .unwrap_or(&image_path)
                .to_string_lossy()
                .to_string();
            ImageInfo { name, path }
        })
        .collect();

    Json(info_list)
}

pub async fn get_runs(State(state): State<AppState>) -> Json<Vec<RunInfo>> {
    let runs = list_runs(&state.output_root).unwrap_or_default();

    let info_list = runs
        .into_iter()
        .map(|(name, metadata)| RunInfo { name, metadata })
        .collect();

    Json(info_list)
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Config(_)) | Some(PipelineError::Json(_)) => StatusCode::BAD_REQUEST,
        Some(PipelineError::Image(_)) | Some(PipelineError::Io(_)) => StatusCode::NOT_FOUND,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn run_prediction(state: &AppState, request: &PredictRequest) -> anyhow::Result<PipelineResult> {
    let descriptors = parse_descriptors(&request.modules).map_err(PipelineError::from)?;
    let path = state.image_root.join(&request.image_path);
    let image = load_image(&path)?;

    let options = PredictOptions {
        round: request.round,
        include_tile_positions: request.tile_positions,
        is_active: None,
    };

    let result = {
        let mut backend = state
            .backend
            .lock()
            .map_err(|_| anyhow::anyhow!("inference backend lock poisoned"))?;
        predict_with_modules(
            image,
            &path.to_string_lossy(),
            &descriptors,
            backend.as_mut(),
            &options,
        )?
    };

    store_run(&state.output_root, &request.image_path, &request.modules, &result)?;
    Ok(result)
}

pub async fn predict_handler(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PipelineResult>, (StatusCode, String)> {
    let outcome = tokio::task::spawn_blocking(move || run_prediction(&state, &request))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match outcome {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            error!("Prediction failed: {:#}", e);
            Err((status_for(&e), format!("{:#}", e)))
        }
    }
}
