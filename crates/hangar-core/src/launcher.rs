//! Launcher trait.
//!
//! A launcher turns a dispatched work unit into running work (a process,
//! container, remote call). What happens inside is opaque to the scheduler.

use async_trait::async_trait;

use crate::Result;
use crate::work::WorkUnit;

/// Trait for work launchers.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Name of this launcher.
    fn name(&self) -> &'static str;

    /// Run the unit to completion. An `Err` is reported to listeners as a
    /// completion with problems.
    async fn launch(&self, unit: &WorkUnit) -> Result<()>;
}
