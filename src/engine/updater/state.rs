//! Update State Machine
//!
//! Explicit states for one update cycle so a half-finished update is never mistaken
//! for a finished one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of the current update cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// No cycle running
    #[default]
    Idle,
    /// Asking the release service for a manifest
    Checking,
    /// Retrieving package and checksum
    Fetching,
    /// Comparing the package digest with the expected checksum
    Verifying,
    /// Extracting, swapping and recording the new version
    Installing,
    Complete,
    Failed,
}

impl UpdateState {
    /// `Complete` and `Failed` end a cycle; the next cycle starts from `Idle`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn can_transition_to(&self, next: UpdateState) -> bool {
        use UpdateState::*;
        match (self, next) {
            (Idle, Checking) => true,
            (Checking, Fetching) | (Checking, Complete) => true,
            (Fetching, Verifying) => true,
            (Verifying, Installing) => true,
            (Installing, Complete) => true,
            (from, Failed) => !from.is_terminal() && *from != Idle,
            (from, Idle) => from.is_terminal() || *from == Idle,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Installing => "installing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Human-readable status emitted on every transition
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub state: UpdateState,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(state: UpdateState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Host callback receiving status events
pub type StatusObserver = Box<dyn Fn(&StatusEvent) + Send + Sync>;
