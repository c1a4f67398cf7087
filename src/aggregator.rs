use crate::config::Settings;
use crate::downloads::{
    DownloadDelta, DownloadEvent, DownloadId, DownloadQuery, DownloadRecord, DownloadSource,
    DownloadState,
};
use crate::error::PaintError;
use crate::icon::{IconRenderer, IconSink, Status};
use crate::redraw::{Completion, RedrawQueue};
use crate::speed::{SpeedTracker, serialize_speeds};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// One icon state: colour plus the bar fraction, present only while
/// something is downloading.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Evaluation {
    pub status: Status,
    pub fraction: Option<f64>,
}

impl Evaluation {
    pub fn idle() -> Self {
        Self {
            status: Status::Normal,
            fraction: None,
        }
    }

    pub fn from_records(unchecked: &[DownloadRecord], active: &[DownloadRecord]) -> Self {
        Self {
            status: resolve_status(unchecked, active),
            fraction: (!active.is_empty()).then(|| completion_fraction(unchecked, active)),
        }
    }
}

/// Error beats Paused beats Success; otherwise Progress while anything is
/// active, Normal when idle.
pub fn resolve_status(unchecked: &[DownloadRecord], active: &[DownloadRecord]) -> Status {
    if unchecked.iter().any(DownloadRecord::is_error) {
        Status::Error
    } else if active.iter().any(|r| r.paused) {
        Status::Paused
    } else if unchecked.iter().any(|r| r.state == DownloadState::Complete) {
        Status::Success
    } else if !active.is_empty() {
        Status::Progress
    } else {
        Status::Normal
    }
}

/// Received over expected bytes across both sets, counting each id once.
/// Records without any known size are left out of both sums.
pub fn completion_fraction(unchecked: &[DownloadRecord], active: &[DownloadRecord]) -> f64 {
    let mut seen = HashSet::new();
    let (received, expected) = active
        .iter()
        .chain(unchecked)
        .filter(|&r| seen.insert(r.id.as_str()))
        .filter(|r| r.expected_bytes() > 0)
        .fold((0u64, 0u64), |(received, expected), r| {
            (received + r.bytes_received, expected + r.expected_bytes())
        });

    if expected == 0 {
        0.0
    } else {
        received as f64 / expected as f64
    }
}

#[derive(Debug)]
pub enum AggregatorEvent {
    Download(DownloadEvent),
    ObserverAttached,
    ObserverDetached,
    SchemeChanged { dark: bool },
    Tick,
}

/// Reduces the live download set to a single icon and keeps it painted.
///
/// Owns the speed trackers and the buffer of terminal downloads nobody has
/// looked at yet. Driven by one event loop, so neither needs a lock.
pub struct DownloadAggregator {
    source: Arc<dyn DownloadSource>,
    sink: Arc<dyn IconSink>,
    renderer: IconRenderer,
    queue: RedrawQueue<PaintError>,
    trackers: HashMap<DownloadId, SpeedTracker>,
    unchecked: Vec<DownloadRecord>,
    observers: usize,
    timer: Option<Interval>,
    poll_interval: Duration,
    speed_window: usize,
    tx: broadcast::Sender<String>,
    status: watch::Sender<Evaluation>,
}

impl DownloadAggregator {
    pub fn new(
        settings: &Settings,
        source: Arc<dyn DownloadSource>,
        sink: Arc<dyn IconSink>,
        tx: broadcast::Sender<String>,
    ) -> Self {
        let (status, _) = watch::channel(Evaluation::idle());
        Self {
            source,
            sink,
            renderer: IconRenderer::new(settings.icon_size, settings.dark_mode),
            queue: RedrawQueue::new(settings.redraw_queue_bound),
            trackers: HashMap::new(),
            unchecked: Vec::new(),
            observers: 0,
            timer: None,
            poll_interval: settings.poll_interval(),
            speed_window: settings.speed_window(),
            tx,
            status,
        }
    }

    pub fn spawn(self) -> AggregatorHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = AggregatorHandle {
            tx: events_tx,
            status: self.status.subscribe(),
        };
        tokio::spawn(self.run(events_rx));
        handle
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<AggregatorEvent>) {
        info!("Download aggregator started");
        self.refresh(false).await;

        loop {
            let event = match self.timer.as_mut() {
                Some(timer) => tokio::select! {
                    event = events.recv() => event,
                    _ = timer.tick() => Some(AggregatorEvent::Tick),
                },
                None => events.recv().await,
            };
            let Some(event) = event else { break };
            self.handle(event).await;
        }

        info!("Download aggregator stopped");
    }

    pub async fn handle(&mut self, event: AggregatorEvent) -> Evaluation {
        match event {
            AggregatorEvent::Download(DownloadEvent::Created(record)) => {
                debug!("Download created: {} ({})", record.filename, record.id);
                self.refresh(false).await
            }
            AggregatorEvent::Download(DownloadEvent::Changed(delta)) => {
                self.record_change(delta).await;
                self.refresh(false).await
            }
            AggregatorEvent::Download(DownloadEvent::Erased(id)) => {
                self.trackers.remove(&id);
                self.refresh(false).await
            }
            AggregatorEvent::ObserverAttached => {
                self.observers += 1;
                self.unchecked.clear();
                info!("Observer attached ({} connected)", self.observers);
                let evaluation = self.refresh(false).await;
                self.send_ping();
                evaluation
            }
            AggregatorEvent::ObserverDetached => {
                self.observers = self.observers.saturating_sub(1);
                info!("Observer detached ({} connected)", self.observers);
                *self.status.borrow()
            }
            AggregatorEvent::SchemeChanged { dark } => {
                info!("Colour scheme changed (dark: {})", dark);
                self.renderer.set_dark_mode(dark);
                self.refresh(false).await
            }
            AggregatorEvent::Tick => self.refresh(true).await,
        }
    }

    async fn record_change(&mut self, delta: DownloadDelta) {
        let Some(state) = delta.state.filter(|s| s.is_terminal()) else {
            return;
        };
        self.trackers.remove(&delta.id);

        // An attached observer already shows the result.
        if delta.is_user_cancellation() || self.observers > 0 {
            return;
        }

        let found = self
            .source
            .search(DownloadQuery::ById(delta.id.clone()))
            .await;
        let Some(mut record) = found.into_iter().next() else {
            debug!("Download {} vanished before it could be recorded", delta.id);
            return;
        };
        record.state = state;
        if delta.error.is_some() {
            record.error = delta.error;
        }
        if record.is_user_cancelled() {
            return;
        }

        match self.unchecked.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.unchecked.push(record),
        }
    }

    async fn refresh(&mut self, tick: bool) -> Evaluation {
        let active = self.source.search(DownloadQuery::InProgress).await;

        let mut poll = tick;
        if active.is_empty() {
            self.stop_timer();
        } else if self.timer.is_none() {
            self.start_timer();
            poll = true;
        }

        if poll && !active.is_empty() {
            self.track_speeds(&active);
            self.send_ping();
        }

        let evaluation = Evaluation::from_records(&self.unchecked, &active);
        self.publish(evaluation);
        evaluation
    }

    fn start_timer(&mut self) {
        let mut timer = tokio::time::interval_at(
            Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
        info!("Downloads active, polling every {:?}", self.poll_interval);
    }

    fn stop_timer(&mut self) {
        if self.timer.take().is_some() {
            info!("No active downloads, polling stopped");
        }
        // Some transfers end without a terminal event ever arriving.
        self.trackers.clear();
    }

    fn track_speeds(&mut self, active: &[DownloadRecord]) {
        for record in active {
            match self.trackers.entry(record.id.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().push_size(record.bytes_received),
                Entry::Vacant(entry) => {
                    entry.insert(SpeedTracker::new(record.bytes_received, self.speed_window));
                }
            }
        }
        self.trackers
            .retain(|id, _| active.iter().any(|r| r.id == *id));
    }

    fn send_ping(&self) {
        let msg = serde_json::json!({
            "type": "ping",
            "payload": serialize_speeds(&self.trackers),
        })
        .to_string();
        let _ = self.tx.send(msg);
    }

    fn publish(&self, evaluation: Evaluation) {
        debug!(
            "Icon evaluated: {:?} ({:?})",
            evaluation.status, evaluation.fraction
        );
        self.status.send_replace(evaluation);
        let _ = self.tx.send(
            serde_json::json!({
                "type": "status",
                "status": evaluation.status,
                "fraction": evaluation.fraction,
            })
            .to_string(),
        );
        // Failures are logged by the queue; a later paint replaces this one.
        let _ = self.paint(evaluation);
    }

    fn paint(&self, evaluation: Evaluation) -> Completion<PaintError> {
        let renderer = self.renderer.clone();
        let sink = self.sink.clone();
        self.queue.enqueue(async move {
            let icon = renderer.render(evaluation.status, evaluation.fraction);
            sink.set_icon(icon).await
        })
    }

    #[cfg(test)]
    fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    #[cfg(test)]
    fn timer_running(&self) -> bool {
        self.timer.is_some()
    }

    #[cfg(test)]
    fn unchecked_count(&self) -> usize {
        self.unchecked.len()
    }
}

/// Cloneable entry point into a spawned aggregator.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<AggregatorEvent>,
    status: watch::Receiver<Evaluation>,
}

impl AggregatorHandle {
    pub fn notify(&self, event: DownloadEvent) {
        let _ = self.tx.send(AggregatorEvent::Download(event));
    }

    /// Re-runs a full poll outside the timer schedule.
    pub fn refresh(&self) {
        let _ = self.tx.send(AggregatorEvent::Tick);
    }

    /// Repaints the current icon in the light or dark palette.
    pub fn set_dark_mode(&self, dark: bool) {
        let _ = self.tx.send(AggregatorEvent::SchemeChanged { dark });
    }

    /// Registers an observer until the returned guard is dropped.
    pub fn attach_observer(&self) -> ObserverGuard {
        let _ = self.tx.send(AggregatorEvent::ObserverAttached);
        ObserverGuard {
            tx: self.tx.clone(),
        }
    }

    pub fn current(&self) -> Evaluation {
        *self.status.borrow()
    }

    #[cfg(test)]
    pub fn subscribe_status(&self) -> watch::Receiver<Evaluation> {
        self.status.clone()
    }
}

pub struct ObserverGuard {
    tx: mpsc::UnboundedSender<AggregatorEvent>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(AggregatorEvent::ObserverDetached);
    }
}
