//! Lock name resolution.
//!
//! Operators target locks by host handles (`lock.front_door`) or groups
//! (`group.all_doors`); the bus only knows z2m device names. A
//! [`LockResolver`] turns the former into the latter through a
//! [`LockDirectory`] provided by the host.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::LocklyConfig;

const GROUP_PREFIX: &str = "group.";
const LOCK_PREFIX: &str = "lock.";

/// What the host knows about one handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockDescriptor {
    /// Display name, which z2m uses as the device topic.
    pub friendly_name: Option<String>,
    /// Registry device name, used when no display name is set.
    pub device_name: Option<String>,
    /// Member handles when the handle is a group.
    pub members: Vec<String>,
}

/// Host device registry lookup.
pub trait LockDirectory: Send + Sync {
    fn lookup(&self, handle: &str) -> Option<LockDescriptor>;
}

/// Fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, LockDescriptor>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lock handle with its display name.
    pub fn with_lock(mut self, handle: &str, friendly_name: &str) -> Self {
        self.entries.insert(
            handle.to_string(),
            LockDescriptor {
                friendly_name: Some(friendly_name.to_string()),
                ..Default::default()
            },
        );
        self
    }

    /// Register a group handle with its members.
    pub fn with_group(mut self, handle: &str, members: &[&str]) -> Self {
        self.entries.insert(
            handle.to_string(),
            LockDescriptor {
                members: members.iter().map(|m| m.to_string()).collect(),
                ..Default::default()
            },
        );
        self
    }

    pub fn insert(&mut self, handle: impl Into<String>, descriptor: LockDescriptor) {
        self.entries.insert(handle.into(), descriptor);
    }
}

impl LockDirectory for StaticDirectory {
    fn lookup(&self, handle: &str) -> Option<LockDescriptor> {
        self.entries.get(handle).cloned()
    }
}

/// Resolves target descriptors to flat device names.
#[derive(Clone)]
pub struct LockResolver {
    directory: Arc<dyn LockDirectory>,
}

impl LockResolver {
    pub fn new(directory: Arc<dyn LockDirectory>) -> Self {
        Self { directory }
    }

    /// Device names of the configured lock set.
    ///
    /// The group handle wins when it resolves to anything, then the
    /// configured handles, then the flat names.
    pub fn configured(&self, config: &LocklyConfig) -> Vec<String> {
        if let Some(group) = &config.group_handle {
            let names = dedup_names(self.resolve_group(group, &mut HashSet::new()));
            if !names.is_empty() {
                return names;
            }
        }
        if !config.lock_handles.is_empty() {
            let names = self.resolve_targets(&config.lock_handles);
            if !names.is_empty() {
                return names;
            }
        }
        tracing::debug!(
            group = ?config.group_handle,
            handles = ?config.lock_handles,
            names = ?config.lock_names,
            "Falling back to flat lock names",
        );
        dedup_names(config.lock_names.iter().filter(|n| !n.is_empty()).cloned().collect())
    }

    /// Device names for explicit operator targets.
    pub fn resolve_targets(&self, handles: &[String]) -> Vec<String> {
        let expanded = self.expand(handles);
        dedup_names(self.resolve_names(&expanded, &mut HashSet::new()))
    }

    /// Replace group handles by their lock members.
    fn expand(&self, handles: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for handle in handles.iter().filter(|h| !h.is_empty()) {
            let members = self.lock_members(handle);
            if handle.starts_with(GROUP_PREFIX) || !members.is_empty() {
                out.extend(members);
            } else {
                out.push(handle.clone());
            }
        }
        out
    }

    fn resolve_names(&self, handles: &[String], visited: &mut HashSet<String>) -> Vec<String> {
        let mut names = Vec::new();
        for handle in handles {
            if handle.starts_with(GROUP_PREFIX) {
                names.extend(self.resolve_group(handle, visited));
                continue;
            }
            let members = self.lock_members(handle);
            if !members.is_empty() {
                if visited.insert(handle.clone()) {
                    names.extend(self.resolve_names(&members, visited));
                }
                continue;
            }
            let descriptor = self.directory.lookup(handle).unwrap_or_default();
            let name = descriptor
                .friendly_name
                .filter(|n| !n.is_empty())
                .or(descriptor.device_name.filter(|n| !n.is_empty()))
                .unwrap_or_else(|| handle.clone());
            names.push(name);
        }
        names
    }

    fn resolve_group(&self, group: &str, visited: &mut HashSet<String>) -> Vec<String> {
        if !visited.insert(group.to_string()) {
            return Vec::new();
        }
        match self.directory.lookup(group) {
            Some(descriptor) => self.resolve_names(&descriptor.members, visited),
            None => {
                tracing::debug!(group, "Group handle not found in directory");
                Vec::new()
            }
        }
    }

    fn lock_members(&self, handle: &str) -> Vec<String> {
        self.directory
            .lookup(handle)
            .map(|d| {
                d.members
                    .into_iter()
                    .filter(|m| m.starts_with(LOCK_PREFIX))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn dedup_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}
