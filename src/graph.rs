//! Bidirectional index between parameter names and the watchers that depend
//! on them.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifies a watcher inside one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    by_name: HashMap<String, HashSet<WatcherId>>,
    by_watcher: HashMap<WatcherId, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `watcher` under each name. Names it already depends on are
    /// left untouched.
    pub fn subscribe<'a, I>(&mut self, watcher: WatcherId, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let deps = self.by_watcher.entry(watcher).or_default();
        for name in names {
            if deps.iter().any(|dep| dep == name) {
                continue;
            }
            deps.push(name.to_string());
            self.by_name
                .entry(name.to_string())
                .or_default()
                .insert(watcher);
        }
        if cfg!(debug_assertions) {
            self.assert_consistent();
        }
    }

    /// Removes `watcher` from every name. Returns false if it was not
    /// subscribed.
    pub fn unsubscribe(&mut self, watcher: WatcherId) -> bool {
        let Some(deps) = self.by_watcher.remove(&watcher) else {
            return false;
        };
        for name in deps {
            if let Some(watchers) = self.by_name.get_mut(&name) {
                watchers.remove(&watcher);
                if watchers.is_empty() {
                    self.by_name.remove(&name);
                }
            }
        }
        if cfg!(debug_assertions) {
            self.assert_consistent();
        }
        true
    }

    pub fn watchers_for(&self, name: &str) -> HashSet<WatcherId> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    pub fn dependencies_of(&self, watcher: WatcherId) -> &[String] {
        self.by_watcher
            .get(&watcher)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Names with at least one watcher.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn contains(&self, watcher: WatcherId) -> bool {
        self.by_watcher.contains_key(&watcher)
    }

    pub fn len(&self) -> usize {
        self.by_watcher.len()
    }

    /// Panics if the two directions of the index disagree.
    pub fn assert_consistent(&self) {
        for (watcher, deps) in &self.by_watcher {
            for name in deps {
                assert!(
                    self.by_name
                        .get(name)
                        .is_some_and(|watchers| watchers.contains(watcher)),
                    "watcher {} depends on {:?} but is missing from its index entry",
                    watcher,
                    name
                );
            }
        }
        for (name, watchers) in &self.by_name {
            assert!(!watchers.is_empty(), "empty index entry for {:?}", name);
            for watcher in watchers {
                assert!(
                    self.by_watcher
                        .get(watcher)
                        .is_some_and(|deps| deps.contains(name)),
                    "index lists watcher {} under {:?} but it does not depend on it",
                    watcher,
                    name
                );
            }
        }
    }
}
