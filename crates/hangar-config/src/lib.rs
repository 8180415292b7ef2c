//! KDL configuration parsing for the Hangar build scheduler.
//!
//! This crate handles parsing of:
//! - System configuration (controller and agent nodes, load clock, queue,
//!   provisioner and record janitor settings)
//! - Timer-triggered job definitions

mod kdl_ext;

pub mod error;
pub mod job;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use job::{JobConfig, ResourceConfig};
pub use system::{
    LoadConfig, ProvisionerConfig, QueueConfig, RecordsConfig, SystemConfig, load_system_config,
    parse_system_config,
};
