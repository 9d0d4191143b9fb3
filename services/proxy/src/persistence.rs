//! Route table persistence.
//!
//! The last applied table is kept on disk so that a restarted proxy keeps
//! serving while the control plane is unreachable. Writes go to a temp file
//! that is renamed into place.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use gpufleet_id::EventId;
use gpufleet_types::RouteEntry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Persisted state file format version.
const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    /// Last applied event id.
    pub cursor: EventId,
    pub routes: Vec<RouteEntry>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cursor: EventId::default(),
            routes: Vec::new(),
        }
    }
}

pub struct StatePersistence {
    state_path: PathBuf,
}

impl StatePersistence {
    pub fn new(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    /// Load state from disk.
    ///
    /// Returns default state if the file doesn't exist or has another
    /// format version; errors if it exists but cannot be parsed.
    pub fn load(&self) -> Result<PersistedState> {
        if !self.state_path.exists() {
            debug!(path = %self.state_path.display(), "No state file, starting fresh");
            return Ok(PersistedState::default());
        }

        let content = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read state file: {}", self.state_path.display()))?;

        let state: PersistedState = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse state file: {}", self.state_path.display())
        })?;

        if state.version != STATE_VERSION {
            warn!(
                file_version = state.version,
                current_version = STATE_VERSION,
                "State file version mismatch, starting fresh"
            );
            return Ok(PersistedState::default());
        }

        info!(
            path = %self.state_path.display(),
            cursor = %state.cursor,
            model_count = state.routes.len(),
            "Loaded route state from disk"
        );

        Ok(state)
    }

    pub fn save(&self, cursor: EventId, routes: Vec<RouteEntry>) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let state = PersistedState {
            version: STATE_VERSION,
            cursor,
            routes,
        };
        let tmp_path = self.state_path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;

        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })?;

        debug!(
            path = %self.state_path.display(),
            cursor = %state.cursor,
            "Saved route state"
        );
        Ok(())
    }
}
