use crate::aggregator::AggregatorHandle;
use crate::config::Settings;
use crate::downloads::DownloadRegistry;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub host_url: String,
    pub downloads: DownloadRegistry,
    pub tx: broadcast::Sender<String>,
    pub aggregator: AggregatorHandle,
}
