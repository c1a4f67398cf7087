use crate::error::RegistryError;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

pub type DownloadId = String;

/// Finished records kept around for listing before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    InProgress,
    Interrupted,
    Complete,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DownloadState::InProgress)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptReason {
    FileFailed,
    NetworkFailed,
    ServerFailed,
    UserCanceled,
    Crash,
}

impl InterruptReason {
    pub fn is_user_cancellation(self) -> bool {
        matches!(self, InterruptReason::UserCanceled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub filename: String,
    pub bytes_received: u64,
    /// Zero when the total is unknown.
    pub total_bytes: u64,
    pub file_size: u64,
    pub state: DownloadState,
    pub paused: bool,
    pub error: Option<InterruptReason>,
}

impl DownloadRecord {
    pub fn new(id: impl Into<DownloadId>, filename: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            bytes_received: 0,
            total_bytes,
            file_size: total_bytes,
            state: DownloadState::InProgress,
            paused: false,
            error: None,
        }
    }

    pub fn expected_bytes(&self) -> u64 {
        self.total_bytes.max(self.file_size)
    }

    pub fn is_active(&self) -> bool {
        self.state == DownloadState::InProgress
    }

    pub fn is_user_cancelled(&self) -> bool {
        self.state == DownloadState::Interrupted
            && self.error.is_some_and(InterruptReason::is_user_cancellation)
    }

    /// Interrupted for any reason other than the user cancelling it.
    pub fn is_error(&self) -> bool {
        self.state == DownloadState::Interrupted && !self.is_user_cancelled()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadQuery {
    ById(DownloadId),
    InProgress,
    All,
}

impl DownloadQuery {
    pub fn matches(&self, record: &DownloadRecord) -> bool {
        match self {
            DownloadQuery::ById(id) => record.id == *id,
            DownloadQuery::InProgress => record.is_active(),
            DownloadQuery::All => true,
        }
    }
}

/// Fields of a record that changed; `None` means unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DownloadDelta {
    pub id: DownloadId,
    pub state: Option<DownloadState>,
    pub paused: Option<bool>,
    pub error: Option<InterruptReason>,
}

impl DownloadDelta {
    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(DownloadState::is_terminal)
    }

    pub fn is_user_cancellation(&self) -> bool {
        self.state == Some(DownloadState::Interrupted)
            && self.error.is_some_and(InterruptReason::is_user_cancellation)
    }
}

#[derive(Clone, Debug)]
pub enum DownloadEvent {
    Created(DownloadRecord),
    Changed(DownloadDelta),
    Erased(DownloadId),
}

/// Query side of wherever download records live.
///
/// Results carry no ordering guarantee and may momentarily miss a record
/// that just changed state.
pub trait DownloadSource: Send + Sync {
    fn search(&self, query: DownloadQuery) -> BoxFuture<'_, Vec<DownloadRecord>>;
}

/// In-memory record store for the transfers this server performs.
#[derive(Clone)]
pub struct DownloadRegistry {
    records: Arc<Mutex<Vec<DownloadRecord>>>,
    events: broadcast::Sender<DownloadEvent>,
    control: Arc<watch::Sender<u64>>,
    history_limit: usize,
}

impl DownloadRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (control, _) = watch::channel(0);
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            events,
            control: Arc::new(control),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DownloadRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    /// Wakes transfers waiting on a pause so they re-check their record.
    fn notify_control(&self) {
        self.control.send_modify(|generation| *generation += 1);
    }

    pub fn begin(&self, filename: &str, total_bytes: u64) -> DownloadId {
        let record = DownloadRecord::new(Uuid::new_v4().to_string(), filename, total_bytes);
        let id = record.id.clone();
        self.lock().push(record.clone());
        self.emit(DownloadEvent::Created(record));
        id
    }

    /// Counts transferred bytes. Progress alone raises no event; observers
    /// pick it up by polling.
    pub fn add_bytes(&self, id: &str, bytes: u64) -> bool {
        let mut records = self.lock();
        match records.iter_mut().find(|r| r.id == id && r.is_active()) {
            Some(record) => {
                record.bytes_received += bytes;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.lock().iter().any(|r| r.id == id && r.paused)
    }

    pub fn set_paused(&self, id: &str, paused: bool) -> Result<(), RegistryError> {
        {
            let mut records = self.lock();
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if !record.is_active() {
                return Err(RegistryError::NotInProgress(id.to_string()));
            }
            if record.paused == paused {
                return Ok(());
            }
            record.paused = paused;
        }

        self.notify_control();
        self.emit(DownloadEvent::Changed(DownloadDelta {
            id: id.to_string(),
            paused: Some(paused),
            ..Default::default()
        }));
        Ok(())
    }

    pub fn complete(&self, id: &str) -> Result<(), RegistryError> {
        self.finish(id, DownloadState::Complete, None)
    }

    pub fn interrupt(&self, id: &str, reason: InterruptReason) -> Result<(), RegistryError> {
        self.finish(id, DownloadState::Interrupted, Some(reason))
    }

    fn finish(
        &self,
        id: &str,
        state: DownloadState,
        error: Option<InterruptReason>,
    ) -> Result<(), RegistryError> {
        let pruned = {
            let mut records = self.lock();
            let index = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if !records[index].is_active() {
                return Err(RegistryError::NotInProgress(id.to_string()));
            }

            // Finished records stay ordered by finish time, oldest first.
            let mut record = records.remove(index);
            record.state = state;
            record.error = error;
            record.paused = false;
            records.push(record);

            Self::prune_history(&mut records, self.history_limit)
        };

        self.notify_control();
        self.emit(DownloadEvent::Changed(DownloadDelta {
            id: id.to_string(),
            state: Some(state),
            paused: None,
            error,
        }));
        for id in pruned {
            debug!("Dropping old download record {}", id);
            self.emit(DownloadEvent::Erased(id));
        }
        Ok(())
    }

    fn prune_history(records: &mut Vec<DownloadRecord>, limit: usize) -> Vec<DownloadId> {
        let finished = records.iter().filter(|r| !r.is_active()).count();
        let mut excess = finished.saturating_sub(limit);
        let mut pruned = Vec::new();
        records.retain(|r| {
            if excess > 0 && !r.is_active() {
                excess -= 1;
                pruned.push(r.id.clone());
                false
            } else {
                true
            }
        });
        pruned
    }

    pub fn erase(&self, id: &str) -> Result<(), RegistryError> {
        {
            let mut records = self.lock();
            let index = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            records.remove(index);
        }

        self.notify_control();
        self.emit(DownloadEvent::Erased(id.to_string()));
        Ok(())
    }

    /// Resolves once the record is no longer paused (or no longer exists).
    pub async fn wait_while_paused(&self, id: &str) {
        let mut control = self.control.subscribe();
        while self.is_paused(id) {
            if control.changed().await.is_err() {
                break;
            }
        }
    }
}

impl DownloadSource for DownloadRegistry {
    fn search(&self, query: DownloadQuery) -> BoxFuture<'_, Vec<DownloadRecord>> {
        let records: Vec<DownloadRecord> = self
            .lock()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        future::ready(records).boxed()
    }
}
