//! The provisioning-complete marker.
//!
//! Presence of the marker is the only thing that selects the hand-off branch.
//! Its JSON body is informational and may be missing or malformed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tsuki_core::{
    chown_to_account, current_unix_timestamp_ms, local_rfc3339_timestamp, write_text_atomic,
    AccountIds,
};

pub const SETUP_MARKER_FILE_NAME: &str = ".tsuki-setup-complete";
pub const SETUP_MARKER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupMarker {
    pub schema_version: u32,
    pub completed: bool,
    pub completed_at: String,
    pub completed_unix_ms: u64,
    pub account: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupTracker {
    marker_path: PathBuf,
    owner: Option<AccountIds>,
}

impl SetupTracker {
    pub fn for_home(home_dir: &Path, owner: Option<AccountIds>) -> Self {
        Self::new(home_dir.join(SETUP_MARKER_FILE_NAME), owner)
    }

    pub fn new(marker_path: PathBuf, owner: Option<AccountIds>) -> Self {
        Self { marker_path, owner }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn is_complete(&self) -> bool {
        self.marker_path.exists()
    }

    /// Atomically creates or replaces the marker.
    pub fn mark_complete(&self, account: &str, note: &str) -> Result<SetupMarker> {
        let marker = SetupMarker {
            schema_version: SETUP_MARKER_SCHEMA_VERSION,
            completed: true,
            completed_at: local_rfc3339_timestamp(),
            completed_unix_ms: current_unix_timestamp_ms(),
            account: account.to_string(),
            note: note.to_string(),
        };
        let mut body = serde_json::to_string_pretty(&marker)
            .context("failed to serialize setup marker")?;
        body.push('\n');
        write_text_atomic(&self.marker_path, &body).with_context(|| {
            format!(
                "failed to persist setup marker {}",
                self.marker_path.display()
            )
        })?;
        if let Some(ids) = self.owner {
            if let Err(error) = chown_to_account(&self.marker_path, ids) {
                tracing::warn!(path = %self.marker_path.display(), %error, "could not hand setup marker to account");
            }
        }
        Ok(marker)
    }

    /// Parsed marker body; `None` when absent or not understood.
    pub fn read(&self) -> Option<SetupMarker> {
        let raw = std::fs::read_to_string(&self.marker_path).ok()?;
        serde_json::from_str::<SetupMarker>(&raw).ok()
    }
}
