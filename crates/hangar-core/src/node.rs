//! Node inventory types shared by configuration and the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// How a node takes work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeMode {
    /// Takes roaming tasks as well as tasks whose label selects it.
    #[default]
    Normal,
    /// Only takes tasks whose label selects it.
    Exclusive,
}

impl FromStr for NodeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(NodeMode::Normal),
            "exclusive" => Ok(NodeMode::Exclusive),
            other => Err(Error::InvalidInput(format!("node mode '{}'", other))),
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeMode::Normal => "normal",
            NodeMode::Exclusive => "exclusive",
        })
    }
}

/// Declared shape of one node, as supplied by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub num_executors: usize,
    pub labels: BTreeSet<String>,
    pub mode: NodeMode,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, num_executors: usize) -> Self {
        Self {
            name: name.into(),
            num_executors,
            labels: BTreeSet::new(),
            mode: NodeMode::Normal,
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }
}
