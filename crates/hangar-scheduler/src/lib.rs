//! Build scheduling for Hangar.
//!
//! Pending tasks wait in the [`Queue`] until their quiet period ends, then
//! get matched to an idle executor on a node whose labels fit and whose
//! resources are free. The [`Engine`] wires the queue to the node
//! inventory, the executor pool and the periodic works that sample load,
//! provision capacity and clean up old build records.

pub mod computer;
pub mod engine;
pub mod executor;
pub mod janitor;
pub mod listener;
pub mod load;
pub mod matcher;
pub mod periodic;
pub mod provisioner;
pub mod queue;
pub mod snapshot;

pub use computer::{Computer, Nodes};
pub use engine::{Engine, EngineBuilder, QueueMaintenance, TaskTrigger};
pub use executor::{Executor, ExecutorPool, ExecutorStatus};
pub use janitor::{BuildRecord, CleanupReport, RecordCleanup};
pub use listener::{ChannelListener, ExecutorEvent, ExecutorListener, Listeners};
pub use load::{
    Label, Labels, LoadSample, LoadSnapshot, LoadStatistics, LoadStatisticsUpdater,
};
pub use matcher::LabelMatcher;
pub use periodic::{AsyncPeriodicWork, PeriodicWork, Timer, TimerHandle};
pub use provisioner::{Cloud, NodeProvisioner, NodeProvisionerInvoker, PlannedNode};
pub use queue::{BlockingPolicy, Completion, NeverBlock, Queue};
pub use snapshot::{CauseRecord, EngineSnapshot, ItemRecord, JsonFileStore, SnapshotStore};
