mod aggregator;
mod config;
mod downloads;
mod error;
mod handlers;
mod icon;
mod redraw;
mod speed;
mod state;
mod tasks;

use axum::{
    Router,
    routing::{delete, get, post},
};
use local_ip_address::local_ip;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{Level, info};

use crate::aggregator::DownloadAggregator;
use crate::config::Settings;
use crate::downloads::DownloadRegistry;
use crate::handlers::{api, files};
use crate::icon::PngFileSink;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting Download Box...");

    if !settings.files_dir.exists() {
        std::fs::create_dir_all(&settings.files_dir).expect("Failed to create files directory");
    }
    if !settings.data_dir.exists() {
        std::fs::create_dir_all(&settings.data_dir).expect("Failed to create data directory");
    }

    let local_ip = local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let host_url = format!("http://{}:{}", local_ip, settings.server_port);

    let state = build_state(settings.clone(), host_url.clone());

    // Start background tasks (download events -> icon aggregator)
    tasks::start_background_tasks(&state);

    // --- Router Setup ---
    let app = create_app(state);

    let port = settings.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);
    info!("Network address: {}", host_url);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}

/// Wires the registry, icon sink and the single aggregator instance.
pub fn build_state(settings: Settings, host_url: String) -> AppState {
    let (tx, _) = broadcast::channel(100);
    let downloads = DownloadRegistry::new(256).with_history_limit(settings.history_limit);
    let sink = PngFileSink::new(settings.icon_path(), tx.clone());
    let aggregator = DownloadAggregator::new(
        &settings,
        Arc::new(downloads.clone()),
        Arc::new(sink),
        tx.clone(),
    )
    .spawn();

    AppState {
        settings,
        host_url,
        downloads,
        tx,
        aggregator,
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(api::server_info))
        .route("/api/files", get(api::list_files))
        .route("/api/status", get(api::download_status))
        .route("/api/downloads", get(api::list_downloads))
        .route("/api/downloads/{id}", delete(api::erase_download))
        .route("/api/downloads/{id}/pause", post(api::pause_download))
        .route("/api/downloads/{id}/resume", post(api::resume_download))
        .route("/api/downloads/{id}/cancel", post(api::cancel_download))
        .route("/api/scheme", post(api::set_scheme))
        .route("/events", get(api::sse_handler))
        .route("/files/{*path}", get(files::download_file))
        .nest_service("/icon", ServeDir::new(state.settings.data_dir.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
