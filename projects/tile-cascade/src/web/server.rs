use crate::pipeline::backend::InferenceBackend;
use crate::web::api::{get_images, get_runs, predict_handler};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared by all handlers. The backend is used by one prediction at a time.
#[derive(Clone)]
pub struct AppState {
    pub image_root: PathBuf,
    pub output_root: PathBuf,
    pub backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/images", get(get_images))
        .route("/api/runs", get(get_runs))
        .route("/api/predict", post(predict_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, state: AppState) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Tile cascade server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
