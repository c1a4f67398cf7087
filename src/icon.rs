use crate::error::PaintError;
use futures::FutureExt;
use futures::future::BoxFuture;
use image::{ImageFormat, Rgba, RgbaImage};
use serde::Serialize;
use std::io::Cursor;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::debug;

/// Icon colour classification, derived fresh on every evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Normal,
    Progress,
    Paused,
    Success,
    Error,
}

const NORMAL_LIGHT: Rgba<u8> = Rgba([0x5e, 0x5e, 0x5e, 0xff]);
const NORMAL_DARK: Rgba<u8> = Rgba([0xff, 0xff, 0xff, 0xff]);
const PROGRESS: Rgba<u8> = Rgba([0x25, 0x66, 0xff, 0xff]);
const PAUSED: Rgba<u8> = Rgba([0xff, 0xff, 0x22, 0xff]);
const SUCCESS: Rgba<u8> = Rgba([0x0b, 0xbf, 0x29, 0xff]);
const ERROR: Rgba<u8> = Rgba([0xff, 0x22, 0x22, 0xff]);

/// Down arrow outline, normalized to a unit box.
const ARROW: [(f64, f64); 7] = [
    (0.285, 0.000),
    (0.285, 0.500),
    (0.000, 0.500),
    (0.500, 1.000),
    (1.000, 0.500),
    (0.725, 0.500),
    (0.725, 0.000),
];

// Percent of the canvas edge when the progress bar is drawn.
const ARROW_PERCENT: u32 = 70;
const BAR_TOP_PERCENT: u32 = 75;

#[derive(Debug, Clone)]
pub struct IconRenderer {
    size: u32,
    dark_mode: bool,
}

impl IconRenderer {
    pub fn new(size: u32, dark_mode: bool) -> Self {
        Self {
            size: size.max(8),
            dark_mode,
        }
    }

    /// Switches the idle arrow between the light and dark palettes.
    pub fn set_dark_mode(&mut self, dark_mode: bool) {
        self.dark_mode = dark_mode;
    }

    pub fn color(&self, status: Status) -> Rgba<u8> {
        match status {
            Status::Normal if self.dark_mode => NORMAL_DARK,
            Status::Normal => NORMAL_LIGHT,
            Status::Progress => PROGRESS,
            Status::Paused => PAUSED,
            Status::Success => SUCCESS,
            Status::Error => ERROR,
        }
    }

    /// Paints the status arrow, plus a progress bar beneath a shrunken arrow
    /// when `fraction` is given.
    pub fn render(&self, status: Status, fraction: Option<f64>) -> RgbaImage {
        let mut canvas = RgbaImage::new(self.size, self.size);
        let side = self.size as f64;
        let color = self.color(status);

        match fraction {
            None => fill_arrow(&mut canvas, 0.0, 0.0, side, color),
            Some(fraction) => {
                let arrow = (self.size * ARROW_PERCENT / 100) as f64;
                let bar_top = (self.size * BAR_TOP_PERCENT / 100) as f64;
                let fraction = if fraction.is_nan() {
                    0.0
                } else {
                    fraction.clamp(0.0, 1.0)
                };

                fill_arrow(&mut canvas, (side - arrow) / 2.0, 0.0, arrow, color);
                fill_rect(&mut canvas, 0.0, bar_top, side, side, self.color(Status::Normal));
                fill_rect(&mut canvas, 0.0, bar_top, side * fraction, side, color);
            }
        }

        canvas
    }
}

fn fill_arrow(canvas: &mut RgbaImage, x: f64, y: f64, extent: f64, color: Rgba<u8>) {
    let points: Vec<(f64, f64)> = ARROW
        .iter()
        .map(|&(px, py)| (px * extent + x, py * extent + y))
        .collect();

    let bottom = (y + extent).ceil().min(canvas.height() as f64) as u32;
    for row in 0..bottom {
        for col in 0..canvas.width() {
            if contains(&points, col as f64 + 0.5, row as f64 + 0.5) {
                canvas.put_pixel(col, row, color);
            }
        }
    }
}

/// Even-odd point-in-polygon test.
fn contains(points: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn fill_rect(canvas: &mut RgbaImage, x0: f64, y0: f64, x1: f64, y1: f64, color: Rgba<u8>) {
    let (width, height) = (canvas.width() as f64, canvas.height() as f64);
    let cols = x0.round().max(0.0) as u32..x1.round().min(width) as u32;
    let rows = y0.round().max(0.0) as u32..y1.round().min(height) as u32;
    for row in rows {
        for col in cols.clone() {
            canvas.put_pixel(col, row, color);
        }
    }
}

/// The platform side that actually shows the icon.
pub trait IconSink: Send + Sync {
    fn set_icon(&self, icon: RgbaImage) -> BoxFuture<'_, Result<(), PaintError>>;
}

/// Publishes the icon as a PNG file and tells observers it changed.
pub struct PngFileSink {
    path: PathBuf,
    tx: broadcast::Sender<String>,
}

impl PngFileSink {
    pub fn new(path: PathBuf, tx: broadcast::Sender<String>) -> Self {
        Self { path, tx }
    }

    async fn write(&self, icon: RgbaImage) -> Result<(), PaintError> {
        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, PaintError> {
            let mut buffer = Cursor::new(Vec::new());
            icon.write_to(&mut buffer, ImageFormat::Png)?;
            Ok(buffer.into_inner())
        })
        .await
        .map_err(|e| PaintError::Task(e.to_string()))??;

        // Write beside the target and rename so readers never see a partial file.
        let staging = self.path.with_extension("png.tmp");
        tokio::fs::write(&staging, &png).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        debug!("Icon written to {:?} ({} bytes)", self.path, png.len());

        let _ = self
            .tx
            .send(serde_json::json!({ "type": "icon" }).to_string());
        Ok(())
    }
}

impl IconSink for PngFileSink {
    fn set_icon(&self, icon: RgbaImage) -> BoxFuture<'_, Result<(), PaintError>> {
        self.write(icon).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SIZE: u32 = 160;
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

    fn renderer() -> IconRenderer {
        IconRenderer::new(SIZE, false)
    }

    #[test]
    fn full_arrow_without_fraction() {
        let icon = renderer().render(Status::Success, None);
        assert_eq!(icon.dimensions(), (SIZE, SIZE));
        // Shaft, head and the empty top corners.
        assert_eq!(*icon.get_pixel(80, 20), SUCCESS);
        assert_eq!(*icon.get_pixel(80, 150), SUCCESS);
        assert_eq!(*icon.get_pixel(5, 5), CLEAR);
        assert_eq!(*icon.get_pixel(154, 5), CLEAR);
        // No bar along the bottom edge.
        assert_eq!(*icon.get_pixel(5, SIZE - 1), CLEAR);
    }

    #[test]
    fn dark_mode_only_changes_idle_colour() {
        let mut renderer = renderer();
        renderer.set_dark_mode(true);
        assert_eq!(renderer.color(Status::Normal), NORMAL_DARK);
        assert_eq!(renderer.color(Status::Error), ERROR);
        renderer.set_dark_mode(false);
        assert_eq!(renderer.color(Status::Normal), NORMAL_LIGHT);
    }

    #[test]
    fn bar_fill_follows_fraction() {
        let icon = renderer().render(Status::Progress, Some(0.5));
        let bar_row = SIZE - 5;
        assert_eq!(*icon.get_pixel(20, bar_row), PROGRESS);
        assert_eq!(*icon.get_pixel(120, bar_row), NORMAL_LIGHT);
        assert_eq!(*icon.get_pixel(80, 20), PROGRESS);
    }

    #[test]
    fn bar_never_overlaps_arrow() {
        let icon = renderer().render(Status::Error, Some(1.0));
        let arrow_bottom = SIZE * ARROW_PERCENT / 100;
        let bar_top = SIZE * BAR_TOP_PERCENT / 100;
        assert!(arrow_bottom < bar_top);
        for row in arrow_bottom..bar_top {
            for col in 0..SIZE {
                assert_eq!(*icon.get_pixel(col, row), CLEAR, "gap pixel {},{}", col, row);
            }
        }
        assert_eq!(*icon.get_pixel(SIZE - 1, SIZE - 1), ERROR);
    }

    #[test]
    fn fraction_is_clamped() {
        let over = renderer().render(Status::Paused, Some(3.0));
        assert_eq!(over, renderer().render(Status::Paused, Some(1.0)));

        let under = renderer().render(Status::Paused, Some(-1.0));
        assert_eq!(*under.get_pixel(0, SIZE - 1), NORMAL_LIGHT);
        assert_eq!(under, renderer().render(Status::Paused, Some(f64::NAN)));
    }

    #[test]
    fn colours_are_fixed_per_status() {
        assert_eq!(renderer().color(Status::Normal), NORMAL_LIGHT);
        assert_eq!(IconRenderer::new(SIZE, true).color(Status::Normal), NORMAL_DARK);
        assert_eq!(
            IconRenderer::new(SIZE, true).color(Status::Error),
            renderer().color(Status::Error)
        );
        assert_eq!(
            renderer().render(Status::Normal, Some(0.3)),
            renderer().render(Status::Normal, Some(0.3))
        );
    }

    #[tokio::test]
    async fn png_sink_writes_file_and_notifies() {
        let tmp = tempdir().unwrap();
        let (tx, mut rx) = broadcast::channel(4);
        let sink = PngFileSink::new(tmp.path().join("icon.png"), tx);

        sink.set_icon(renderer().render(Status::Normal, None))
            .await
            .unwrap();

        let decoded = image::open(tmp.path().join("icon.png")).unwrap();
        assert_eq!(decoded.width(), SIZE);
        assert!(rx.recv().await.unwrap().contains("icon"));
    }

    #[tokio::test]
    async fn png_sink_reports_io_failure() {
        let tmp = tempdir().unwrap();
        let (tx, _) = broadcast::channel(4);
        let sink = PngFileSink::new(tmp.path().join("missing").join("icon.png"), tx);

        let result = sink.set_icon(renderer().render(Status::Normal, None)).await;
        assert!(matches!(result, Err(PaintError::Io(_))));
    }
}
