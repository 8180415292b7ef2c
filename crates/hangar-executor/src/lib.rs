//! Work launchers for the Hangar build scheduler.
//!
//! Provides [`Launcher`] implementations that turn dispatched work units
//! into running work:
//! - Local processes in per-task workspaces

pub mod shell;

pub use hangar_core::Launcher;
pub use shell::ShellLauncher;
