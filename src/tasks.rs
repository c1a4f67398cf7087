use crate::state::AppState;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub fn start_background_tasks(state: &AppState) {
    // Download events -> aggregator
    let mut events = state.downloads.subscribe();
    let aggregator = state.aggregator.clone();
    tokio::spawn(async move {
        info!("Forwarding download events to the icon aggregator");
        loop {
            match events.recv().await {
                Ok(event) => aggregator.notify(event),
                Err(RecvError::Lagged(skipped)) => {
                    // Missed events may hide a state change; poll instead.
                    warn!("Dropped {} download events, forcing a refresh", skipped);
                    aggregator.refresh();
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
