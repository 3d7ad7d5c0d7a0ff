//! On-disk session state shared between `shfrp` invocations.
//!
//! The data directory holds `data.json` (last value of every parameter and
//! which running sessions listen to which names) and `events`, the
//! append-only event log running sessions follow. Writers of `data.json`
//! serialize through an exclusive lock on `data.json.lck`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::Message;

const DATA_FILE: &str = "data.json";
const EVENTS_FILE: &str = "events";
const CONFIG_FILE: &str = "shfrp.toml";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Parameter name to the ids of sessions listening to it.
    #[serde(default)]
    pub listened: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<config dir>/shfrp`, falling back to `~/.config/shfrp`.
    pub fn default_root() -> Option<PathBuf> {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .map(|dir| dir.join("shfrp"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_path(&self) -> PathBuf {
        self.root.join(DATA_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Creates the directory and an empty event log if missing.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .with_context(|| format!("failed to create {}", self.events_path().display()))?;
        Ok(())
    }

    pub fn load(&self) -> Result<StateData> {
        let path = self.data_path();
        if !path.exists() {
            return Ok(StateData::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(StateData::default());
        }
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Read-modify-write of `data.json` under the state lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut StateData) -> T) -> Result<T> {
        let _lock = StateLock::acquire(&self.root.join(format!("{}.lck", DATA_FILE)))?;
        let mut data = self.load()?;
        let result = f(&mut data);
        self.save(&data)?;
        Ok(result)
    }

    fn save(&self, data: &StateData) -> Result<()> {
        let path = self.data_path();
        let tmp = self.root.join(format!("{}.tmp", DATA_FILE));
        let serialized = serde_json::to_string(data)?;
        fs::write(&tmp, serialized).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.update(|data| {
            data.parameters.insert(name.to_string(), value.to_string());
        })
    }

    pub fn add_listener(&self, client: &str, names: &[String]) -> Result<()> {
        self.update(|data| {
            for name in names {
                let listeners = data.listened.entry(name.clone()).or_default();
                if !listeners.iter().any(|id| id == client) {
                    listeners.push(client.to_string());
                }
            }
        })
    }

    pub fn remove_listener(&self, client: &str, names: &[String]) -> Result<()> {
        self.update(|data| {
            for name in names {
                if let Some(listeners) = data.listened.get_mut(name) {
                    listeners.retain(|id| id != client);
                }
            }
        })
    }

    /// Appends `message` to the event log as one JSON line.
    pub fn publish(&self, message: &Message) -> Result<()> {
        let path = self.events_path();
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))?;
        tracing::debug!(ident = %message.ident, changed = ?message.changed, "published");
        Ok(())
    }
}

/// Exclusive advisory lock, released on drop.
struct StateLock(#[allow(dead_code)] File);

impl StateLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("failed to lock {}", path.display()));
            }
        }
        Ok(Self(file))
    }
}
