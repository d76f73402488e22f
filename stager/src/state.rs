//! Stager runtime state and its on-disk copy.

use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use podlite_shared::container::ExitStatus;
use podlite_shared::schema::{AppState, StagerPhase, StagerState};
use podlite_shared::{PodliteError, PodliteResult};

/// Guards the state and rewrites the state file after each change.
pub struct StateTracker {
    path: PathBuf,
    state: Mutex<StagerState>,
    /// Serializes writers of the state file and its temporary copy.
    write: Mutex<()>,
}

impl StateTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StagerState::default()),
            write: Mutex::new(()),
        }
    }

    /// Starts tracking every app in the pod, before any of them run.
    pub fn populate<'a>(&self, apps: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.lock();
        state.apps.clear();
        state.state = StagerPhase::Setup;
        for name in apps {
            state.apps.insert(name.to_string(), AppState::default());
        }
    }

    pub fn snapshot(&self) -> StagerState {
        self.state.lock().clone()
    }

    pub fn phase(&self) -> StagerPhase {
        self.state.lock().state
    }

    /// Moves to `phase`; returns false when already there.
    pub fn set_phase(&self, phase: StagerPhase) -> bool {
        let mut state = self.state.lock();
        if state.state == phase {
            return false;
        }
        state.state = phase;
        true
    }

    pub fn set_pid(&self, app: &str, pid: i32) {
        if let Some(entry) = self.state.lock().apps.get_mut(app) {
            entry.pid = pid;
        }
    }

    pub fn record_exit(&self, app: &str, result: &PodliteResult<ExitStatus>) {
        let mut state = self.state.lock();
        let Some(entry) = state.apps.get_mut(app) else {
            return;
        };
        entry.exited = true;
        match result {
            Ok(status) => {
                entry.exit_code = status.exit_code();
                if !status.success() {
                    entry.exit_reason = status.to_string();
                }
            }
            Err(e) => entry.exit_reason = e.to_string(),
        }
    }

    /// Writes the state file, replacing the previous copy atomically.
    pub fn persist(&self) -> PodliteResult<()> {
        // Held across the snapshot so the last writer always carries the
        // newest state.
        let _write = self.write.lock();
        let body = {
            let state = self.state.lock();
            serde_json::to_vec(&*state)?
        };

        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            PodliteError::Storage(format!("failed to write the stager state: {}", e))
        })
    }
}
