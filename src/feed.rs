//! Following the event log.
//!
//! A background thread watches the event log with `notify` and forwards every
//! complete line appended after the feed started, parsed as a [`Message`],
//! to the session's event channel. Reading starts at the end of the file, so
//! a session only sees updates published after it started. A slow poll
//! backs up the file watcher on filesystems that do not report changes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::events::{Event, Message};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Bytes before the read offset remembered to notice an in-place rewrite.
const FINGERPRINT_LEN: usize = 64;

/// Starts following `path` from its current end.
pub fn spawn_feed(path: PathBuf, tx: mpsc::Sender<Event>) {
    let tail = Tail::at_end(&path);
    std::thread::spawn(move || {
        if let Err(err) = follow(&path, tail, &tx) {
            tracing::error!("event log feed for {} failed: {:#}", path.display(), err);
            let _ = tx.blocking_send(Event::FeedFailed {
                error: format!("{:#}", err),
            });
        }
    });
}

fn follow(path: &Path, mut tail: Tail, tx: &mpsc::Sender<Event>) -> Result<()> {
    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", path.display()))?;

    loop {
        for message in tail.read_new(path)? {
            if tx.blocking_send(Event::Message(message)).is_err() {
                return Ok(());
            }
        }
        match raw_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(_)) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Err(err)) => tracing::warn!("watch error on {}: {}", path.display(), err),
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
        if tx.is_closed() {
            return Ok(());
        }
    }
}

/// Incremental reader over an append-only file of JSON lines.
///
/// A file that shrank, was replaced by another inode, or no longer holds
/// the bytes last read before the offset is read again from the start.
#[derive(Debug)]
struct Tail {
    offset: u64,
    partial: Vec<u8>,
    fingerprint: Vec<u8>,
    inode: Option<u64>,
}

impl Tail {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            partial: Vec::new(),
            fingerprint: Vec::new(),
            inode: None,
        }
    }

    /// Positioned at the current end of `path`, like `tail -n 0`.
    fn at_end(path: &Path) -> Self {
        let Ok(mut file) = File::open(path) else {
            return Self::new(0);
        };
        let Ok(meta) = file.metadata() else {
            return Self::new(0);
        };
        let mut tail = Self::new(meta.len());
        tail.inode = inode(&meta);
        if let Ok(fingerprint) = read_before(&mut file, tail.offset, FINGERPRINT_LEN) {
            tail.fingerprint = fingerprint;
        }
        tail
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
        self.fingerprint.clear();
    }

    fn rewritten(&self, file: &mut File, meta: &std::fs::Metadata) -> Result<bool> {
        if self.inode.is_some() && inode(meta) != self.inode {
            return Ok(true);
        }
        if meta.len() < self.offset {
            return Ok(true);
        }
        if self.fingerprint.is_empty() {
            return Ok(false);
        }
        let current = read_before(file, self.offset, self.fingerprint.len())?;
        Ok(current != self.fingerprint)
    }

    /// Returns the messages in lines completed since the last call.
    fn read_new(&mut self, path: &Path) -> Result<Vec<Message>> {
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let meta = file.metadata()?;
        if self.rewritten(&mut file, &meta)? {
            tracing::warn!("{} was rewritten, reading from the start", path.display());
            self.reset();
        }
        self.inode = inode(&meta);
        let len = meta.len();
        if len == self.offset {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        let read = file.read_to_end(&mut chunk)?;
        self.offset += read as u64;
        self.fingerprint.extend_from_slice(&chunk);
        let excess = self.fingerprint.len().saturating_sub(FINGERPRINT_LEN);
        self.fingerprint.drain(..excess);
        self.partial.extend_from_slice(&chunk);

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        let mut messages = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(err) => tracing::warn!("skipping malformed event {:?}: {}", line, err),
            }
        }
        Ok(messages)
    }
}

/// Reads up to `len` bytes ending at `offset`.
fn read_before(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let start = offset.saturating_sub(len as u64);
    file.seek(SeekFrom::Start(start))?;
    let mut buffer = Vec::with_capacity(len);
    file.by_ref().take(offset - start).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}
