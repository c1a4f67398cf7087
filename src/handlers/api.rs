use crate::aggregator::Evaluation;
use crate::downloads::{DownloadQuery, DownloadRecord, DownloadSource, InterruptReason};
use crate::error::RegistryError;
use crate::handlers::files::encode_path;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;
use walkdir::WalkDir;

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub relative_path: String,
    pub size: u64,
    pub url: String,
}

pub async fn server_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ips = local_ip_address::list_afinet_netifas()
        .map(|list| {
            list.into_iter()
                .filter(|(_, ip)| ip.is_ipv4() && !ip.is_loopback())
                .map(|(_, ip)| ip.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Json(serde_json::json!({
        "ips": ips,
        "port": state.settings.server_port,
        "host_url": state.host_url,
    }))
}

pub async fn list_files(State(state): State<AppState>) -> Json<Vec<FileEntry>> {
    let root = &state.settings.files_dir;
    let mut files: Vec<FileEntry> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|entry| {
            let relative_path = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                url: format!("/files/{}", encode_path(&relative_path)),
                relative_path,
            }
        })
        .collect();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Json(files)
}

pub async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadRecord>> {
    Json(state.downloads.search(DownloadQuery::All).await)
}

pub async fn download_status(State(state): State<AppState>) -> Json<Evaluation> {
    Json(state.aggregator.current())
}

fn registry_error(e: RegistryError) -> (StatusCode, String) {
    let status = match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::NotInProgress(_) => StatusCode::CONFLICT,
    };
    (status, e.to_string())
}

pub async fn pause_download(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.downloads.set_paused(&id, true).map_err(registry_error)?;
    info!("Download paused: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_download(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.downloads.set_paused(&id, false).map_err(registry_error)?;
    info!("Download resumed: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_download(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .downloads
        .interrupt(&id, InterruptReason::UserCanceled)
        .map_err(registry_error)?;
    info!("Download cancelled: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn erase_download(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.downloads.erase(&id).map_err(registry_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Observer channel. The connection counts as an attached observer until
/// the client goes away.
#[derive(Debug, Deserialize)]
pub struct SchemeRequest {
    pub dark: bool,
}

/// Follows the host's light/dark preference at runtime.
pub async fn set_scheme(
    State(state): State<AppState>,
    Json(request): Json<SchemeRequest>,
) -> StatusCode {
    state.aggregator.set_dark_mode(request.dark);
    StatusCode::NO_CONTENT
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.tx.subscribe();
    let observer = state.aggregator.attach_observer();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(move |msg| {
        let _attached = &observer;
        match msg {
            Ok(msg) => Ok(Event::default().data(msg)),
            Err(_) => Ok(Event::default().comment("keepalive")),
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
