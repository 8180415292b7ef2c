//! Core domain types and traits for the Hangar build scheduler.
//!
//! This crate contains:
//! - Identifiers and the common error type
//! - Tasks, causes and environment-contributing actions
//! - Queue item and work unit value types
//! - Resources and their conflict rules
//! - Label expressions
//! - Node inventory specs
//! - Decayed time series used by load statistics
//! - The launcher trait

pub mod error;
pub mod id;
pub mod item;
pub mod label;
pub mod launcher;
pub mod node;
pub mod resource;
pub mod task;
pub mod timeseries;
pub mod work;

pub use error::{Error, Result};
pub use id::{ItemId, TaskId, WorkUnitId};
pub use item::{CauseOfBlockage, ItemOutcome, ItemState, LeftReason, QueueItem};
pub use label::LabelExpr;
pub use launcher::Launcher;
pub use node::{NodeMode, NodeSpec};
pub use resource::{Resource, ResourceController, ResourceList};
pub use task::{
    Action, Affinity, Cause, CauseCount, CauseSet, ParametersAction, RemoteCause, RestoredCause,
    Task, TaskKind, TimerCause, UpstreamCause, UserCause,
};
pub use timeseries::{MultiStageTimeSeries, TimeScale, TimeSeries};
pub use work::{ExecutorRef, LossPolicy, WorkUnit};
