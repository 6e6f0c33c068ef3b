//! Records of finished actions.
//!
//! Composites hand every child that reaches a terminal state to an
//! [`ActionLog`]; the supervisor does the same for the root of a run. The
//! engine makes no assumption about where records end up.

use crate::action::{ActionId, ActionState};
use crate::error::{ActionFailure, EngineResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Snapshot of an action that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedAction {
    pub id: ActionId,
    /// Leaf type name or composite mode.
    pub kind: String,
    pub description: String,
    pub short_description: String,
    pub state: ActionState,
    pub parent: Option<ActionId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, with = "humantime_serde")]
    pub run_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ActionFailure>,
}

/// Write-only sink for completed actions.
pub trait ActionLog: Send + Sync {
    fn log_completed_action(&self, action: &CompletedAction);
}

/// Emits one `tracing` event per completed action.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActionLog;

impl ActionLog for TracingActionLog {
    fn log_completed_action(&self, action: &CompletedAction) {
        match &action.failure {
            Some(failure) => warn!(
                action = %action.id,
                kind = %action.kind,
                description = %action.description,
                state = %action.state,
                run_time = ?action.run_time,
                %failure,
                "action completed"
            ),
            None => info!(
                action = %action.id,
                kind = %action.kind,
                description = %action.description,
                state = %action.state,
                run_time = ?action.run_time,
                "action completed"
            ),
        }
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullActionLog;

impl ActionLog for NullActionLog {
    fn log_completed_action(&self, _action: &CompletedAction) {}
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryActionLog {
    records: Mutex<Vec<CompletedAction>>,
}

impl MemoryActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far, oldest first.
    pub fn records(&self) -> Vec<CompletedAction> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl ActionLog for MemoryActionLog {
    fn log_completed_action(&self, action: &CompletedAction) {
        self.records.lock().push(action.clone());
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesActionLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesActionLog {
    /// Open `path` for appending, creating it if needed.
    pub fn create(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, action: &CompletedAction) -> EngineResult<()> {
        let line = serde_json::to_string(action)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl ActionLog for JsonLinesActionLog {
    fn log_completed_action(&self, action: &CompletedAction) {
        if let Err(e) = self.append(action) {
            warn!(path = %self.path.display(), error = %e, "failed to write action log record");
        }
    }
}
