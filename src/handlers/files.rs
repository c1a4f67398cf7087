use crate::downloads::{DownloadId, DownloadRegistry, InterruptReason};
use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap},
    },
    response::IntoResponse,
};
use futures::stream::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::io;
use std::path::{Component, Path as StdPath, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

/// One file transfer as seen by the registry. Dropping the last clone ends
/// the record: complete when every byte went out, interrupted otherwise.
struct Transfer {
    registry: DownloadRegistry,
    id: DownloadId,
    total_size: u64,
}

impl Transfer {
    async fn forward(&self, chunk: Result<Bytes, io::Error>) -> Result<Bytes, io::Error> {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Read failed for download {}: {}", self.id, e);
                let _ = self.registry.interrupt(&self.id, InterruptReason::FileFailed);
                return Err(e);
            }
        };

        self.registry.wait_while_paused(&self.id).await;
        if !self.registry.add_bytes(&self.id, bytes.len() as u64) {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "download is no longer in progress",
            ));
        }
        Ok(bytes)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        let Some(record) = self.registry.get(&self.id) else {
            return;
        };
        if !record.is_active() {
            info!("Download {} ended as {:?}", self.id, record.state);
            return;
        }

        let result = if record.bytes_received >= self.total_size {
            info!("Download complete: {} ({})", record.filename, self.id);
            self.registry.complete(&self.id)
        } else {
            warn!(
                "Download {} dropped after {}/{} bytes",
                self.id, record.bytes_received, self.total_size
            );
            self.registry
                .interrupt(&self.id, InterruptReason::NetworkFailed)
        };
        if let Err(e) = result {
            warn!("Could not finish download {}: {}", self.id, e);
        }
    }
}

/// Joins a request path onto `root`, refusing anything that could climb out.
pub fn resolve_path(root: &StdPath, path: &str) -> Option<PathBuf> {
    let relative = StdPath::new(path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    let joined = root.join(relative);
    joined.starts_with(root).then_some(joined)
}

pub async fn download_file(
    Path(path): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(file_path) = resolve_path(&state.settings.files_dir, &path) else {
        return Err((StatusCode::FORBIDDEN, "Forbidden"));
    };

    let file = match File::open(&file_path).await {
        Ok(f) => f,
        Err(e) => {
            error!("File download failed: {} (Path: {:?})", e, file_path);
            return Err((StatusCode::NOT_FOUND, "File not found"));
        }
    };

    let total_size = match file.metadata().await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        Ok(_) => return Err((StatusCode::NOT_FOUND, "File not found")),
        Err(e) => {
            error!("Failed to stat {:?}: {}", file_path, e);
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file"));
        }
    };
    let filename = file_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.clone());

    let download_id = state.downloads.begin(&filename, total_size);
    info!("Starting download: {} (ID: {})", filename, download_id);

    let transfer = Arc::new(Transfer {
        registry: state.downloads.clone(),
        id: download_id,
        total_size,
    });
    let stream = ReaderStream::new(file).then(move |chunk| {
        let transfer = transfer.clone();
        async move { transfer.forward(chunk).await }
    });

    let body = Body::from_stream(stream);

    let mut headers = HeaderMap::new();
    let mime = mime_guess::from_path(&filename).first_or_octet_stream();
    if let Ok(val) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, val);
    }

    if mime == mime_guess::mime::APPLICATION_OCTET_STREAM
        && let Ok(val) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
    {
        headers.insert(CONTENT_DISPOSITION, val);
    }

    if let Ok(val) = HeaderValue::from_str(&total_size.to_string()) {
        headers.insert(CONTENT_LENGTH, val);
    }

    Ok((headers, body))
}

pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string())
        .collect::<Vec<_>>()
        .join("/")
}
