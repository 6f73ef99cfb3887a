//! Periodic work driven by the scheduler tick: shipping result files written by
//! the instrumentation hook and pruning what the hook left behind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};

use crate::client::RelayClient;
use crate::envelope::{Envelope, SendPolicy};
use crate::store::LogpointStore;
use crate::types::{events, LogpointHeader, RemovalReason, ResultMessage};
use crate::{AgentConfig, Result};

const SHIP_RESULTS: &str = "ship-results";
const PRUNE_PARTIALS: &str = "prune-partials";
const PRUNE_INTERVAL: Duration = Duration::from_secs(10);
/// Dotfiles older than this are abandoned partial writes.
const PARTIAL_MAX_AGE: Duration = Duration::from_secs(60);

/// A result file as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultFile {
    Message(ResultMessage),
    Blob(Vec<u8>),
}

impl ResultFile {
    pub fn parse(bytes: Vec<u8>) -> Self {
        match serde_json::from_slice::<ResultMessage>(&bytes) {
            Ok(message) if !message.event.is_empty() => Self::Message(message),
            _ => Self::Blob(bytes),
        }
    }

    fn is_evaluation_error(&self) -> bool {
        matches!(self, Self::Message(m) if m.event == events::LOGPOINT_ERROR_EVALUATING)
    }

    /// ID of the logpoint an evaluation error refers to.
    fn logpoint_id(&self) -> Option<String> {
        let Self::Message(message) = self else {
            return None;
        };
        [message.header.as_ref(), message.data.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|section| section.get("logpoint_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn into_envelope(self) -> Envelope {
        match self {
            Self::Message(message) => Envelope {
                header: message.header,
                data: message.data,
                ..Envelope::new(message.event)
            },
            Self::Blob(bytes) => {
                Envelope::new(events::DEBUG_EVENT).with_data(json!({ "dump": BASE64.encode(bytes) }))
            }
        }
    }
}

/// Files ready to ship, oldest first. Dotfiles are still being written.
pub fn pending_results(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

pub struct MaintenanceCycle {
    results_dir: PathBuf,
    ship_interval: Duration,
    last_run: HashMap<&'static str, Instant>,
    /// Files already sent whose deletion failed. They are never sent again.
    undeleted: HashSet<PathBuf>,
    /// Evictions announced as pending whose store removal failed, by ID.
    pending_evictions: BTreeMap<String, i64>,
    remove_file: fn(&Path) -> io::Result<()>,
}

impl MaintenanceCycle {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            results_dir: config.results_dir(),
            ship_interval: config.ship_interval,
            last_run: HashMap::new(),
            undeleted: HashSet::new(),
            pending_evictions: BTreeMap::new(),
            remove_file: |path| fs::remove_file(path),
        }
    }

    /// Records a run of `task` and returns `true` when it ran less than
    /// `interval` ago, in which case the caller skips it.
    fn already_ran(&mut self, task: &'static str, interval: Duration, now: Instant) -> bool {
        match self.last_run.get(task) {
            Some(last) if now.saturating_duration_since(*last) < interval => true,
            _ => {
                self.last_run.insert(task, now);
                false
            }
        }
    }

    /// Runs whichever tasks are due at `now`. Callers only tick while the
    /// relay session is ready.
    pub fn tick(
        &mut self,
        now: Instant,
        client: &mut RelayClient,
        store: &mut LogpointStore,
    ) -> Result<()> {
        if !self.already_ran(PRUNE_PARTIALS, PRUNE_INTERVAL, now) {
            self.prune_partials();
        }

        if !self.already_ran(SHIP_RESULTS, self.ship_interval, now) {
            let shipped = self.ship_results(client, store)?;
            if shipped > 0 {
                tracing::debug!("Shipped {} result files", shipped);
            }
        }

        Ok(())
    }

    /// Sends every pending result file and deletes it once handed to the
    /// transport. A transport failure stops the pass and leaves the rest on
    /// disk for the next one. A file that cannot be deleted after sending is
    /// remembered and only its deletion is retried.
    pub fn ship_results(
        &mut self,
        client: &mut RelayClient,
        store: &mut LogpointStore,
    ) -> Result<usize> {
        self.retry_evictions(client, store)?;
        let mut shipped = 0;

        for path in pending_results(&self.results_dir)? {
            if self.undeleted.contains(&path) {
                if self.delete_shipped(&path) {
                    self.undeleted.remove(&path);
                }
                continue;
            }

            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Skipping unreadable result file {}: {}", path.display(), e);
                    continue;
                }
            };

            let result = ResultFile::parse(bytes);
            if let ResultFile::Blob(_) = result {
                tracing::debug!("Forwarding {} as an opaque dump", path.display());
            }

            let evaluation_error = result.is_evaluation_error();
            let failed_id = result.logpoint_id().filter(|_| evaluation_error);
            let policy = if evaluation_error {
                SendPolicy::PLAIN
            } else {
                client.results_policy()
            };

            client.send(result.into_envelope(), policy)?;
            if !self.delete_shipped(&path) {
                self.undeleted.insert(path.clone());
            }
            shipped += 1;

            match failed_id {
                Some(id) => self.evict(&id, client, store)?,
                None if evaluation_error => {
                    tracing::warn!("Evaluation error in {} names no logpoint", path.display())
                }
                None => {}
            }
        }

        self.undeleted.retain(|path| path.exists());
        Ok(shipped)
    }

    fn delete_shipped(&self, path: &Path) -> bool {
        match (self.remove_file)(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!("Could not delete shipped result {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Removes a logpoint whose evaluation failed, announcing the removal
    /// before and after it happens. When the store cannot be persisted the
    /// removal stays pending and is retried on the next pass.
    fn evict(
        &mut self,
        logpoint_id: &str,
        client: &mut RelayClient,
        store: &mut LogpointStore,
    ) -> Result<()> {
        if self.pending_evictions.contains_key(logpoint_id) {
            return Ok(());
        }
        let Some(project_id) = store.get(logpoint_id).map(|logpoint| logpoint.project_id) else {
            tracing::warn!("Evaluation error for unknown logpoint {}", logpoint_id);
            return Ok(());
        };

        tracing::info!("Evicting logpoint {} after an evaluation error", logpoint_id);
        client.send_removal(
            events::LOGPOINT_REMOVAL_PENDING,
            removal_header(logpoint_id, project_id),
            RemovalReason::EvaluationError,
        )?;
        self.pending_evictions.insert(logpoint_id.to_string(), project_id);
        self.finish_eviction(logpoint_id, project_id, client, store)
    }

    fn retry_evictions(&mut self, client: &mut RelayClient, store: &mut LogpointStore) -> Result<()> {
        let pending: Vec<(String, i64)> = self
            .pending_evictions
            .iter()
            .map(|(id, project)| (id.clone(), *project))
            .collect();
        for (logpoint_id, project_id) in pending {
            self.finish_eviction(&logpoint_id, project_id, client, store)?;
        }
        Ok(())
    }

    fn finish_eviction(
        &mut self,
        logpoint_id: &str,
        project_id: i64,
        client: &mut RelayClient,
        store: &mut LogpointStore,
    ) -> Result<()> {
        if let Err(e) = store.remove(logpoint_id) {
            tracing::warn!("Eviction of {} still pending: {}", logpoint_id, e);
            return Ok(());
        }
        self.pending_evictions.remove(logpoint_id);
        client.send_removal(
            events::LOGPOINT_REMOVED,
            removal_header(logpoint_id, project_id),
            RemovalReason::EvaluationError,
        )
    }

    /// Removes dotfiles the hook abandoned mid-write.
    fn prune_partials(&self) {
        let Ok(entries) = fs::read_dir(&self.results_dir) else {
            tracing::warn!("Results directory {} is unreadable", self.results_dir.display());
            return;
        };

        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > PARTIAL_MAX_AGE);
            if stale {
                match fs::remove_file(entry.path()) {
                    Ok(()) => tracing::info!("Pruned stale partial file {}", entry.path().display()),
                    Err(e) => tracing::warn!("Could not prune {}: {}", entry.path().display(), e),
                }
            }
        }
    }
}

fn removal_header(logpoint_id: &str, project_id: i64) -> LogpointHeader {
    LogpointHeader {
        logpoint_id: logpoint_id.to_string(),
        project_id: Some(project_id),
    }
}
