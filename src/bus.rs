//! Fan-out of parameter changes to the watchers that depend on them.
//!
//! The bus hooks one store callback per referenced name. When a change
//! arrives, every watcher indexed under that name gets a wake-up on its
//! mailbox. A mailbox holds at most one pending wake-up, so a burst of
//! changes collapses into a single re-render.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

use crate::graph::{DependencyGraph, WatcherId};
use crate::store::{Change, ParameterStore};

pub struct ChangeBus {
    store: ParameterStore,
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    graph: DependencyGraph,
    mailboxes: HashMap<WatcherId, Arc<Notify>>,
    hooked: HashSet<String>,
}

fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChangeBus {
    pub fn new(store: ParameterStore) -> Self {
        Self {
            store,
            inner: Arc::default(),
        }
    }

    /// Subscribes `watcher` to `names` and returns its mailbox.
    pub fn attach(&self, watcher: WatcherId, names: &[String]) -> Arc<Notify> {
        let mailbox = Arc::new(Notify::new());
        let mut inner = lock(&self.inner);
        inner
            .graph
            .subscribe(watcher, names.iter().map(String::as_str));
        inner.mailboxes.insert(watcher, Arc::clone(&mailbox));
        for name in names {
            if !inner.hooked.insert(name.clone()) {
                continue;
            }
            let bus = Arc::downgrade(&self.inner);
            self.store
                .on_change(name, move |change| fan_out(&bus, change));
        }
        tracing::debug!(%watcher, ?names, "watcher attached");
        mailbox
    }

    /// Removes `watcher` from the index and drops its mailbox. Once this
    /// returns no further change reaches the watcher.
    pub fn detach(&self, watcher: WatcherId) -> bool {
        let mut inner = lock(&self.inner);
        let removed = inner.graph.unsubscribe(watcher);
        inner.mailboxes.remove(&watcher);
        if removed {
            tracing::debug!(%watcher, "watcher detached");
        }
        removed
    }

    pub fn watchers_for(&self, name: &str) -> HashSet<WatcherId> {
        lock(&self.inner).graph.watchers_for(name)
    }

    pub fn dependencies_of(&self, watcher: WatcherId) -> Vec<String> {
        lock(&self.inner).graph.dependencies_of(watcher).to_vec()
    }

    pub fn assert_consistent(&self) {
        let inner = lock(&self.inner);
        inner.graph.assert_consistent();
        assert_eq!(
            inner.mailboxes.len(),
            inner.graph.len(),
            "mailboxes and index disagree on the live watcher set"
        );
        for watcher in inner.mailboxes.keys() {
            assert!(
                inner.graph.contains(*watcher),
                "mailbox for {} without an index entry",
                watcher
            );
        }
    }
}

fn fan_out(bus: &Weak<Mutex<BusInner>>, change: &Change) {
    let Some(inner) = bus.upgrade() else {
        return;
    };
    let inner = lock(&inner);
    for watcher in inner.graph.watchers_for(&change.name) {
        if let Some(mailbox) = inner.mailboxes.get(&watcher) {
            mailbox.notify_one();
        }
    }
    tracing::trace!(
        parameter = %change.name,
        version = change.version,
        "change fanned out"
    );
}
