//! Update State Machine
//!
//! Tracks where each firmware component is in its update so operators can see
//! progress and the last failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::orchestrator::{Stage, Versions};
use crate::engine::firmware::{Component, Version};

/// Current status of one component's update track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrackState {
    /// No update in progress
    #[default]
    Idle,
    /// Comparing installed and available versions
    Comparing,
    /// Fetching the firmware bundle
    Fetching,
    /// Verifying checkpoint, inclusion proof and digest
    Verifying,
    /// Handing the bundle to the installer
    Installing,
    /// Installed, waiting for the device to restart
    RebootPending { version: Version },
    /// Update failed
    Failed { stage: Stage, reason: String },
}

/// Complete update state persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UpdateState {
    pub os: TrackState,
    pub applet: TrackState,
    /// Versions found on the device at the last check
    pub installed: Option<Versions<Version>>,
    /// Newest logged versions at the last check
    pub latest: Option<Versions<Option<Version>>>,
    /// Last time we checked for updates
    pub last_check: Option<DateTime<Utc>>,
    /// Error that aborted the last cycle, if any
    pub last_error: Option<String>,
}

impl UpdateState {
    /// Load state from disk, or create default if not exists
    pub fn load(state_path: &Path) -> Result<Self, StateError> {
        if state_path.exists() {
            let content = fs::read_to_string(state_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save state to disk atomically
    pub fn save(&self, state_path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self)?;

        if let Some(parent) = state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = state_path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, state_path)?;

        Ok(())
    }

    pub fn track(&self, component: Component) -> &TrackState {
        match component {
            Component::Os => &self.os,
            Component::Applet => &self.applet,
        }
    }

    pub fn track_mut(&mut self, component: Component) -> &mut TrackState {
        match component {
            Component::Os => &mut self.os,
            Component::Applet => &mut self.applet,
        }
    }

    /// True once any component is installed and waiting for a restart
    pub fn has_pending_reboot(&self) -> bool {
        Component::ALL
            .iter()
            .any(|c| matches!(self.track(*c), TrackState::RebootPending { .. }))
    }
}

/// State persistence errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse state: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_default() {
        let state = UpdateState::default();
        assert_eq!(state.os, TrackState::Idle);
        assert_eq!(state.applet, TrackState::Idle);
        assert!(!state.has_pending_reboot());
    }

    #[test]
    fn test_track_access() {
        let mut state = UpdateState::default();
        *state.track_mut(Component::Applet) = TrackState::RebootPending {
            version: Version::new(1, 0, 4),
        };
        assert_eq!(state.track(Component::Os), &TrackState::Idle);
        assert!(state.has_pending_reboot());
    }

    #[test]
    fn test_state_persistence() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("update-state.json");

        let mut state = UpdateState::default();
        state.os = TrackState::Failed {
            stage: Stage::Verifying,
            reason: "bad signature".to_string(),
        };
        state.installed = Some(Versions {
            os: Version::new(1, 0, 1),
            applet: Version::new(1, 0, 2),
        });
        state.last_check = Some(Utc::now());
        state.save(&state_path).unwrap();

        let loaded = UpdateState::load(&state_path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_state_file_is_default() {
        let dir = tempdir().unwrap();
        let loaded = UpdateState::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, UpdateState::default());
    }

    #[test]
    fn test_serialized_status_tag() {
        let json = serde_json::to_value(TrackState::Failed {
            stage: Stage::Installing,
            reason: "disk full".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "installing");
    }
}
