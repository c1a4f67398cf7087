use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub files_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub poll_interval_ms: u64,
    pub speed_window_secs: u64,
    pub redraw_queue_bound: usize,
    pub icon_size: u32,
    pub dark_mode: bool,
    pub history_limit: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 3000)?
            .set_default("files_dir", "./files")?
            .set_default("data_dir", "./data")?
            .set_default("log_level", "info")?
            .set_default("poll_interval_ms", 500)?
            .set_default("speed_window_secs", 10)?
            .set_default("redraw_queue_bound", 2)?
            .set_default("icon_size", 160)?
            .set_default("dark_mode", false)?
            .set_default("history_limit", 200)?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. DOWNLOAD_BOX_SERVER_PORT=8080)
            .add_source(Environment::with_prefix("DOWNLOAD_BOX"));

        builder.build()?.try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Number of rate samples that cover `speed_window_secs` at the poll rate.
    pub fn speed_window(&self) -> usize {
        let interval = self.poll_interval_ms.max(1);
        let samples = (self.speed_window_secs * 1000).div_ceil(interval);
        samples.max(1) as usize
    }

    pub fn icon_path(&self) -> PathBuf {
        self.data_dir.join("icon.png")
    }
}

#[cfg(test)]
pub(crate) fn test_settings(files_dir: PathBuf, data_dir: PathBuf) -> Settings {
    Settings {
        server_port: 0,
        files_dir,
        data_dir,
        log_level: "info".to_string(),
        poll_interval_ms: 500,
        speed_window_secs: 10,
        redraw_queue_bound: 2,
        icon_size: 160,
        dark_mode: false,
        history_limit: 200,
    }
}
