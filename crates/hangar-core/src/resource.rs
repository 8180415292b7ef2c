//! Named resources and the read/write conflict rules between activities.
//!
//! A [`Resource`] is a `/`-separated path. Locking a resource implicitly
//! locks everything below it, so `/ws` collides with `/ws/app`. A
//! [`ResourceList`] records how an activity uses each resource: reads never
//! collide with each other, while writes collide with any other use unless
//! the resource allows several concurrent writers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{Error, Result, WorkUnitId};

/// A lockable, hierarchically named resource such as a workspace directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    path: String,
    num_concurrent_write: u32,
}

impl Resource {
    /// Parse a resource path. Empty segments are dropped, so `ws//a/` and
    /// `/ws/a` name the same resource.
    pub fn new(path: &str) -> Result<Self> {
        Self::with_concurrent_writes(path, 1)
    }

    /// A resource that tolerates up to `limit` simultaneous writers.
    pub fn with_concurrent_writes(path: &str, limit: u32) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(Error::Admission(format!(
                "resource path '{}' has no segments",
                path
            )));
        }
        if limit == 0 {
            return Err(Error::Admission(format!(
                "resource '{}' must allow at least one writer",
                path
            )));
        }
        Ok(Self {
            path: format!("/{}", segments.join("/")),
            num_concurrent_write: limit,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn num_concurrent_write(&self) -> u32 {
        self.num_concurrent_write
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, other: &Resource) -> bool {
        other.path == self.path
            || (other.path.starts_with(&self.path)
                && other.path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }

    /// Whether `count` combined writes on `self` and `that` exceed what the
    /// shallower of the two resources allows.
    fn collides_with(&self, that: &Resource, count: u32) -> bool {
        if self.is_ancestor_or_self(that) {
            return self.num_concurrent_write < count;
        }
        if that.is_ancestor_or_self(self) {
            return that.num_concurrent_write < count;
        }
        false
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl PartialOrd for Resource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Resource {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// How one activity uses one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResourceUse {
    resource: Resource,
    /// Number of write locks; zero means read-only use.
    writes: u32,
}

/// The set of resources an activity reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceList {
    uses: BTreeMap<String, ResourceUse>,
}

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read of `resource`.
    pub fn read(mut self, resource: Resource) -> Self {
        self.uses
            .entry(resource.path.clone())
            .or_insert(ResourceUse {
                resource,
                writes: 0,
            });
        self
    }

    /// Declare a write of `resource`.
    pub fn write(mut self, resource: Resource) -> Self {
        self.uses
            .entry(resource.path.clone())
            .or_insert(ResourceUse {
                resource,
                writes: 0,
            })
            .writes += 1;
        self
    }

    /// Combine several lists, summing their write counts.
    pub fn union<'a>(lists: impl IntoIterator<Item = &'a ResourceList>) -> ResourceList {
        let mut merged = ResourceList::new();
        for list in lists {
            for (path, entry) in &list.uses {
                merged
                    .uses
                    .entry(path.clone())
                    .or_insert(ResourceUse {
                        resource: entry.resource.clone(),
                        writes: 0,
                    })
                    .writes += entry.writes;
            }
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.uses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.uses.len()
    }

    /// Resources in path order with their write counts.
    pub fn iter(&self) -> impl Iterator<Item = (&Resource, u32)> {
        self.uses.values().map(|u| (&u.resource, u.writes))
    }

    pub fn is_written(&self, resource: &Resource) -> bool {
        self.uses
            .get(&resource.path)
            .map(|u| u.writes > 0)
            .unwrap_or(false)
    }

    /// The first resource over which `self` and `that` collide, if any.
    pub fn conflict_with(&self, that: &ResourceList) -> Option<Resource> {
        one_way_conflict(self, that).or_else(|| one_way_conflict(that, self))
    }

    pub fn conflicts_with(&self, that: &ResourceList) -> bool {
        self.conflict_with(that).is_some()
    }
}

/// Checks every write in `lhs` against every use in `rhs`.
fn one_way_conflict(lhs: &ResourceList, rhs: &ResourceList) -> Option<Resource> {
    for written in lhs.uses.values().filter(|u| u.writes > 0) {
        for other in rhs.uses.values() {
            // A read on the other side can never share with a writer.
            let count = if other.writes > 0 {
                other.writes.saturating_add(written.writes)
            } else {
                u32::MAX
            };
            if written.resource.collides_with(&other.resource, count) {
                return Some(written.resource.clone());
            }
        }
    }
    None
}

/// Tracks the resources held by running work units.
///
/// Callers check and acquire while holding the queue lock, so a check and the
/// acquisition that follows it cannot interleave with another dispatch.
#[derive(Debug, Default)]
pub struct ResourceController {
    in_progress: HashMap<WorkUnitId, ResourceList>,
    in_use: ResourceList,
}

impl ResourceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an activity using `list` could start now.
    pub fn can_run(&self, list: &ResourceList) -> bool {
        self.missing_resource(list).is_none()
    }

    /// The resource that blocks `list`, if any.
    pub fn missing_resource(&self, list: &ResourceList) -> Option<Resource> {
        self.in_use.conflict_with(list)
    }

    pub fn acquire(&mut self, unit: WorkUnitId, list: ResourceList) {
        self.in_progress.insert(unit, list);
        self.recompute();
    }

    pub fn release(&mut self, unit: &WorkUnitId) {
        if self.in_progress.remove(unit).is_some() {
            self.recompute();
        }
    }

    /// Union of everything currently held.
    pub fn in_use(&self) -> &ResourceList {
        &self.in_use
    }

    fn recompute(&mut self) {
        self.in_use = ResourceList::union(self.in_progress.values());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(path: &str) -> Resource {
        Resource::new(path).unwrap()
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(res("ws//a/").path(), "/ws/a");
        assert_eq!(res("/ws/a"), res("ws/a"));
        assert!(Resource::new("//").is_err());
        assert!(Resource::new("").is_err());
    }

    #[test]
    fn test_ancestor_matching_respects_segments() {
        assert!(res("/ws").is_ancestor_or_self(&res("/ws/app")));
        assert!(res("/ws").is_ancestor_or_self(&res("/ws")));
        assert!(!res("/ws").is_ancestor_or_self(&res("/wsx")));
        assert!(!res("/ws/app").is_ancestor_or_self(&res("/ws")));
    }

    #[test]
    fn test_reads_share() {
        let a = ResourceList::new().read(res("/ws/a"));
        let b = ResourceList::new().read(res("/ws/a"));
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_write_conflicts_with_read_and_write() {
        let w = ResourceList::new().write(res("/ws/a"));
        let r = ResourceList::new().read(res("/ws/a"));
        assert_eq!(w.conflict_with(&r), Some(res("/ws/a")));
        assert_eq!(r.conflict_with(&w), Some(res("/ws/a")));
        assert!(w.conflicts_with(&w.clone()));
    }

    #[test]
    fn test_parent_lock_covers_descendants() {
        let parent = ResourceList::new().write(res("/ws"));
        let child = ResourceList::new().read(res("/ws/a/b"));
        assert!(parent.conflicts_with(&child));
        assert!(child.conflicts_with(&parent));

        let sibling = ResourceList::new().write(res("/other"));
        assert!(!parent.conflicts_with(&sibling));
    }

    #[test]
    fn test_concurrent_write_limit() {
        let shared = Resource::with_concurrent_writes("/pool", 2).unwrap();
        let one = ResourceList::new().write(shared.clone());
        let two = ResourceList::new().write(shared.clone());
        assert!(!one.conflicts_with(&two));

        let both = ResourceList::union([&one, &two]);
        let three = ResourceList::new().write(shared);
        assert!(both.conflicts_with(&three));
    }

    #[test]
    fn test_controller_tracks_running_units() {
        let mut controller = ResourceController::new();
        let first = WorkUnitId::new();
        let second = WorkUnitId::new();
        let ws_a = ResourceList::new().write(res("/ws/a"));
        let ws_b = ResourceList::new().write(res("/ws/b"));

        controller.acquire(first, ws_a.clone());
        assert!(!controller.can_run(&ws_a));
        assert!(controller.can_run(&ws_b));

        controller.acquire(second, ws_b.clone());
        let whole = ResourceList::new().read(res("/ws"));
        assert!(controller.missing_resource(&whole).is_some());

        controller.release(&first);
        assert!(controller.can_run(&ws_a));
        assert!(!controller.can_run(&ws_b));

        controller.release(&second);
        assert!(controller.in_use().is_empty());
    }
}
