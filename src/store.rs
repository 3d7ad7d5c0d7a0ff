//! Parameter storage with per-name change dispatch.
//!
//! The store is the single source of truth for "did this change". Each
//! parameter carries a version that is bumped on every effective write, and
//! every bump is published to the callbacks registered for that name. Each
//! name gets its own dispatcher thread, so delivery for one parameter is
//! strictly ordered by version while a slow callback on one name never holds
//! up another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A single named parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    /// Bumped on every effective `set` or `touch`; 0 means never written.
    pub version: u64,
}

impl Parameter {
    fn unset(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: String::new(),
            version: 0,
        }
    }
}

/// A version increment, as delivered to `on_change` callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub value: String,
    pub version: u64,
}

type Callback = Box<dyn Fn(&Change) + Send + 'static>;

enum Dispatch {
    Register(Callback),
    Change(Change),
}

/// Shared handle to the parameter space of one session.
///
/// Cloning is cheap; all clones see the same parameters.
#[derive(Clone, Default)]
pub struct ParameterStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    params: HashMap<String, Parameter>,
    dispatchers: HashMap<String, mpsc::UnboundedSender<Dispatch>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current value and version of a known parameter.
    pub fn get(&self, name: &str) -> Result<(String, u64)> {
        self.lock()
            .params
            .get(name)
            .map(|param| (param.value.clone(), param.version))
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Like [`get`](Self::get), but unknown names read as an empty value at
    /// version 0 so templates stay renderable before their first `set`.
    pub fn lookup(&self, name: &str) -> (String, u64) {
        self.get(name).unwrap_or_default()
    }

    /// Current version of `name`, 0 if unknown.
    pub fn version(&self, name: &str) -> u64 {
        self.lock().params.get(name).map_or(0, |param| param.version)
    }

    /// Makes `name` known without writing it.
    pub fn declare(&self, name: &str) {
        self.lock()
            .params
            .entry(name.to_string())
            .or_insert_with(|| Parameter::unset(name));
    }

    /// Writes `value` and returns the resulting version.
    ///
    /// Writing the value a parameter already holds is a no-op: the version
    /// stays put and no change is published.
    pub fn set(&self, name: &str, value: impl Into<String>) -> u64 {
        let value = value.into();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let param = inner
            .params
            .entry(name.to_string())
            .or_insert_with(|| Parameter::unset(name));
        if param.value == value {
            tracing::trace!(parameter = name, version = param.version, "set is a no-op");
            return param.version;
        }
        param.value = value;
        param.version += 1;
        let version = param.version;
        publish(&inner.dispatchers, param);
        tracing::debug!(parameter = name, version, "parameter set");
        version
    }

    /// Bumps the version without changing the value, so dependants re-run.
    pub fn touch(&self, name: &str) -> u64 {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let param = inner
            .params
            .entry(name.to_string())
            .or_insert_with(|| Parameter::unset(name));
        param.version += 1;
        let version = param.version;
        publish(&inner.dispatchers, param);
        tracing::debug!(parameter = name, version, "parameter touched");
        version
    }

    /// Registers `callback` for every future version increment of `name`.
    ///
    /// Callbacks for one name run in registration order on that name's
    /// dispatcher thread; they may block without delaying other names.
    pub fn on_change<F>(&self, name: &str, callback: F)
    where
        F: Fn(&Change) + Send + 'static,
    {
        let mut inner = self.lock();
        let tx = inner
            .dispatchers
            .entry(name.to_string())
            .or_insert_with(|| spawn_dispatcher(name));
        let _ = tx.send(Dispatch::Register(Box::new(callback)));
    }

    /// Reads several parameters under a single lock.
    ///
    /// Unknown names come back empty at version 0.
    pub fn snapshot<'a, I>(&self, names: I) -> HashMap<String, (String, u64)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let inner = self.lock();
        names
            .into_iter()
            .map(|name| {
                let entry = inner
                    .params
                    .get(name)
                    .map(|param| (param.value.clone(), param.version))
                    .unwrap_or_default();
                (name.to_string(), entry)
            })
            .collect()
    }

    /// All known parameters, sorted by name.
    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params: Vec<Parameter> = self.lock().params.values().cloned().collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }
}

// Runs under the store lock, so dispatcher order matches version order.
fn publish(dispatchers: &HashMap<String, mpsc::UnboundedSender<Dispatch>>, param: &Parameter) {
    let Some(tx) = dispatchers.get(&param.name) else {
        return;
    };
    let _ = tx.send(Dispatch::Change(Change {
        name: param.name.clone(),
        value: param.value.clone(),
        version: param.version,
    }));
}

// Callbacks may block; each name gets its own OS thread.
fn spawn_dispatcher(name: &str) -> mpsc::UnboundedSender<Dispatch> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
    let thread_name = name.to_string();
    let spawned = std::thread::Builder::new()
        .name(format!("shfrp-change-{}", name))
        .spawn(move || {
            let mut callbacks: Vec<Callback> = Vec::new();
            while let Some(message) = rx.blocking_recv() {
                match message {
                    Dispatch::Register(callback) => callbacks.push(callback),
                    Dispatch::Change(change) => {
                        for callback in &callbacks {
                            callback(&change);
                        }
                    }
                }
            }
            tracing::trace!(parameter = %thread_name, "change dispatcher stopped");
        });
    if let Err(err) = spawned {
        tracing::error!(parameter = name, "failed to start change dispatcher: {}", err);
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn get_fails_for_unknown_and_lookup_defaults() {
        let store = ParameterStore::new();
        assert_eq!(
            store.get("name"),
            Err(Error::UnknownParameter("name".to_string()))
        );
        assert_eq!(store.lookup("name"), (String::new(), 0));

        store.declare("name");
        assert_eq!(store.get("name"), Ok((String::new(), 0)));
    }

    #[test]
    fn set_bumps_version_only_on_new_values() {
        let store = ParameterStore::new();
        assert_eq!(store.set("name", "Jim"), 1);
        assert_eq!(store.set("name", "Jim"), 1);
        assert_eq!(store.set("name", "Bob"), 2);
        assert_eq!(store.get("name"), Ok(("Bob".to_string(), 2)));
        assert_eq!(store.touch("name"), 3);
        assert_eq!(store.lookup("name"), ("Bob".to_string(), 3));
    }

    #[test]
    fn snapshot_reads_known_and_unknown() {
        let store = ParameterStore::new();
        store.set("a", "1");
        let snap = store.snapshot(["a", "b"]);
        assert_eq!(snap["a"], ("1".to_string(), 1));
        assert_eq!(snap["b"], (String::new(), 0));
    }

    #[tokio::test]
    async fn on_change_delivers_each_increment_in_order() {
        let store = ParameterStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        store.on_change("name", move |change| {
            let _ = first.send(("first", change.clone()));
        });
        store.on_change("name", move |change| {
            let _ = tx.send(("second", change.clone()));
        });

        store.set("name", "a");
        store.set("name", "a");
        store.set("name", "b");
        store.set("other", "x");

        let mut seen = Vec::new();
        for _ in 0..4 {
            let (who, change) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push((who, change.value, change.version));
        }
        assert_eq!(
            seen,
            vec![
                ("first", "a".to_string(), 1),
                ("second", "a".to_string(), 1),
                ("first", "b".to_string(), 2),
                ("second", "b".to_string(), 2),
            ]
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    /// Registers a callback on each of `slow` that blocks until released,
    /// then checks that a change to "fast" still arrives promptly.
    async fn assert_fast_delivery_despite(slow: &[&str]) {
        let store = ParameterStore::new();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for name in slow {
            let release_rx = Arc::clone(&release_rx);
            store.on_change(name, move |_| {
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_millis(1500));
            });
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.on_change("fast", move |change| {
            let _ = tx.send(change.value.clone());
        });

        for name in slow {
            store.set(name, "1");
        }
        store.set("fast", "1");

        let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        for _ in slow {
            let _ = release_tx.send(());
        }
        assert_eq!(got.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn slow_callback_does_not_block_other_names_on_current_thread() {
        assert_fast_delivery_despite(&["slow"]).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn more_slow_names_than_workers_do_not_block_other_names() {
        assert_fast_delivery_despite(&["slow1", "slow2", "slow3"]).await;
    }

    #[test]
    fn on_change_works_without_a_runtime() {
        let store = ParameterStore::new();
        let (tx, rx) = std::sync::mpsc::channel();
        store.on_change("name", move |change| {
            let _ = tx.send(change.version);
        });
        store.set("name", "a");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(1));
    }

    #[test]
    fn concurrent_readers_never_see_a_torn_write() {
        const WRITES: u64 = 2000;
        let store = ParameterStore::new();
        let (tx, rx) = std::sync::mpsc::channel();
        store.on_change("n", move |change| {
            let _ = tx.send((change.value.clone(), change.version));
        });

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for v in 1..=WRITES {
                    assert_eq!(store.set("n", v.to_string()), v);
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    while last < WRITES {
                        let (value, version) = store.lookup("n");
                        if version > 0 {
                            assert_eq!(value, version.to_string());
                        }
                        let snap = store.snapshot(["n"]);
                        let (value, snap_version) = &snap["n"];
                        if *snap_version > 0 {
                            assert_eq!(*value, snap_version.to_string());
                        }
                        assert!(*snap_version >= version);
                        last = *snap_version;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        for expected in 1..=WRITES {
            let (value, version) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(version, expected);
            assert_eq!(value, expected.to_string());
        }
    }
}
