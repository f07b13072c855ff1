// Pomodoro Engine - Core module structure
pub mod config;
pub mod platform;
pub mod cli;
pub mod updater;

pub use config::UpdaterConfig;
pub use platform::OsIdentifier;
