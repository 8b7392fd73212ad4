//! Append-only JSON-lines log of persisted frame reports

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One persisted frame, keyed by capture time and source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub source_tag: String,
    pub source_uri: String,
    pub payload: serde_json::Value,
}

pub struct LogStore {
    path: PathBuf,
    file: File,
    written: u64,
}

impl LogStore {
    /// Open (or create) the log at `path`, appending to existing content
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this handle
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.written += 1;
        Ok(())
    }

    /// Read every entry of a log file; malformed lines are skipped
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LogEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Skipping malformed log line: {}", e),
            }
        }
        Ok(entries)
    }
}
