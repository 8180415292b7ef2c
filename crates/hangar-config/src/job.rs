//! Timer-triggered job definitions.

use hangar_core::{Affinity, Resource, ResourceList, Task, TaskKind};
use kdl::KdlNode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::kdl_ext::*;
use crate::{ConfigError, ConfigResult};

/// A job scheduled by the server on a fixed period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Label expression; `None` lets the job roam.
    pub label: Option<String>,
    /// Pin to the controller node instead of roaming.
    pub controller: bool,
    /// Trigger period; jobs without one are only scheduled once at startup.
    pub every: Option<Duration>,
    /// Overrides the queue's default quiet period.
    pub quiet_period: Option<Duration>,
    pub command: Vec<String>,
    pub resources: Vec<ResourceConfig>,
    pub flyweight: bool,
    pub concurrent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub path: String,
    pub write: bool,
    pub concurrent_writes: u32,
}

impl JobConfig {
    /// Build the task this job schedules.
    pub fn to_task(&self) -> ConfigResult<Task> {
        let affinity = match (&self.label, self.controller) {
            (Some(_), true) => {
                return Err(ConfigError::InvalidValue {
                    field: format!("job '{}'", self.name),
                    message: "label and controller=#true are mutually exclusive".to_string(),
                });
            }
            (None, true) => Affinity::Controller,
            (label, false) => Affinity::from_label(label.as_deref())?,
        };

        let mut resources = ResourceList::new();
        for r in &self.resources {
            let resource = Resource::with_concurrent_writes(&r.path, r.concurrent_writes)?;
            resources = if r.write {
                resources.write(resource)
            } else {
                resources.read(resource)
            };
        }

        let mut task = Task::new(self.name.as_str())
            .with_affinity(affinity)
            .with_resources(resources)
            .with_command(self.command.clone())
            .concurrent(self.concurrent);
        if self.flyweight {
            task.kind = TaskKind::Flyweight;
        }
        Ok(task)
    }
}

pub(crate) fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut command = Vec::new();
    let mut resources = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    command = get_all_string_args(child);
                }
                "resource" => {
                    let path = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("resource path in job '{}'", name))
                    })?;
                    let concurrent_writes = get_count_prop(child, "concurrent-writes")?
                        .unwrap_or(1)
                        .try_into()
                        .map_err(|_| ConfigError::InvalidValue {
                            field: "concurrent-writes".to_string(),
                            message: "too large".to_string(),
                        })?;
                    resources.push(ResourceConfig {
                        path,
                        write: get_bool_prop(child, "write").unwrap_or(false),
                        concurrent_writes,
                    });
                }
                _ => {}
            }
        }
    }

    Ok(JobConfig {
        label: get_string_prop(node, "label"),
        controller: get_bool_prop(node, "controller").unwrap_or(false),
        every: get_seconds_prop(node, "every")?,
        quiet_period: get_seconds_prop(node, "quiet-period")?,
        flyweight: get_bool_prop(node, "flyweight").unwrap_or(false),
        concurrent: get_bool_prop(node, "concurrent").unwrap_or(false),
        name,
        command,
        resources,
    })
}
