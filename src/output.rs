//! Display of fresh results.
//!
//! Each delivery replaces what was shown before: its output goes to stdout,
//! or overwrites the `--output` file. Failures and non-zero exits are
//! reported on stderr so they never end up mixed into the output file.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::runner::ExecutionStatus;
use crate::watcher::Delivery;

#[derive(Debug, Clone, Default)]
pub struct Display {
    target: Option<PathBuf>,
}

impl Display {
    pub fn new(target: Option<PathBuf>) -> Self {
        Self { target }
    }

    pub fn show(&mut self, delivery: &Delivery) -> Result<()> {
        match &self.target {
            Some(path) => fs::write(path, &delivery.output)
                .with_context(|| format!("failed to write {}", path.display()))?,
            None => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(delivery.output.as_bytes())?;
                stdout.flush()?;
            }
        }
        if let Some(note) = format_status(&delivery.status) {
            eprintln!("{}: {}", delivery.command, note);
        }
        Ok(())
    }
}

/// Describes an unsuccessful status; None for a clean exit.
pub fn format_status(status: &ExecutionStatus) -> Option<String> {
    match status {
        ExecutionStatus::Exited { code: Some(0) } => None,
        ExecutionStatus::Exited { code: Some(code) } => Some(format!("exited {}", code)),
        ExecutionStatus::Exited { code: None } => Some("terminated by signal".to_string()),
        ExecutionStatus::Failed { error } => Some(format!("failed: {}", error)),
    }
}
