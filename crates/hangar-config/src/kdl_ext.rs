//! Helper functions for extracting values from KDL nodes.

use kdl::KdlNode;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Numeric property accepting either an integer or a float.
pub(crate) fn get_number_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<f64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    if let Some(i) = value.as_integer() {
        return Ok(Some(i as f64));
    }
    if let Some(f) = value.as_float() {
        return Ok(Some(f));
    }
    Err(ConfigError::InvalidValue {
        field: name.to_string(),
        message: format!("expected a number, got {}", value),
    })
}

pub(crate) fn get_count_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<usize>> {
    match get_number_prop(node, name)? {
        None => Ok(None),
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(Some(n as usize)),
        Some(n) => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected a non-negative whole number, got {}", n),
        }),
    }
}

/// Duration property given in seconds.
pub(crate) fn get_seconds_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    match get_number_prop(node, name)? {
        None => Ok(None),
        Some(secs) if secs >= 0.0 && secs.is_finite() => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected non-negative seconds, got {}", secs),
        }),
    }
}

pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes like labels="a" labels="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
