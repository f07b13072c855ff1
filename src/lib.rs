//! Pomodoro Timer - self-update core
//!
//! The application shell calls [`engine::updater::UpdateOrchestrator::check_and_apply`]
//! at startup and relaunches itself when told a restart is required.

pub mod engine;

pub use engine::config::UpdaterConfig;
pub use engine::updater::{ApplyOutcome, RestartRequired, UpdateOrchestrator};
