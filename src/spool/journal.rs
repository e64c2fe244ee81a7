// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Write-ahead journal of spool file creations.
//!
//! An append-only line log at `{base}/journal.log`. Every spool file
//! creation writes `B <source_dir> <filename>` before the `.tmp` is opened
//! and `C <source_dir> <filename>` after the rename is durable. On boot,
//! sequences with a begin but no commit mark interrupted creations whose
//! temp files must be unlinked. The log is truncated whenever every entry
//! is committed, so it stays a few lines long in steady state.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

pub const JOURNAL_FILE: &str = "journal.log";

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    /// Entries begun but not yet committed.
    open_entries: HashSet<(String, String)>,
}

impl Journal {
    /// Open (or create) the journal under `base`, replaying existing
    /// entries to rebuild the uncommitted set.
    pub fn open(base: &Path) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let path = base.join(JOURNAL_FILE);
        let open_entries = match File::open(&path) {
            Ok(f) => Self::replay(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !open_entries.is_empty() {
            warn!(uncommitted = open_entries.len(), "Journal has interrupted spool writes");
        }
        Ok(Journal { path, file, open_entries })
    }

    fn replay(file: File) -> HashSet<(String, String)> {
        let mut open = HashSet::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("B"), Some(dir), Some(name)) => {
                    open.insert((dir.to_string(), name.to_string()));
                }
                (Some("C"), Some(dir), Some(name)) => {
                    open.remove(&(dir.to_string(), name.to_string()));
                }
                // Torn tail line from a crash mid-append.
                _ => break,
            }
        }
        open
    }

    fn append(&mut self, tag: &str, source_dir: &str, filename: &str) -> Result<()> {
        writeln!(self.file, "{tag} {source_dir} {filename}")?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Record that a spool file creation is starting.
    pub fn begin(&mut self, source_dir: &str, filename: &str) -> Result<()> {
        self.append("B", source_dir, filename)?;
        self.open_entries.insert((source_dir.to_string(), filename.to_string()));
        Ok(())
    }

    /// Record that the file was renamed into place and is durable.
    pub fn commit(&mut self, source_dir: &str, filename: &str) -> Result<()> {
        self.append("C", source_dir, filename)?;
        self.open_entries.remove(&(source_dir.to_string(), filename.to_string()));
        self.truncate_if_clean()?;
        Ok(())
    }

    /// Sequences begun but never committed, as `(source_dir, filename)`.
    pub fn uncommitted(&self) -> impl Iterator<Item = &(String, String)> {
        self.open_entries.iter()
    }

    /// Forget an uncommitted entry after its temp file was unlinked during
    /// recovery.
    pub fn resolve(&mut self, source_dir: &str, filename: &str) -> Result<()> {
        if self.open_entries.remove(&(source_dir.to_string(), filename.to_string())) {
            self.append("C", source_dir, filename)?;
            self.truncate_if_clean()?;
        }
        Ok(())
    }

    /// Rewrite the log empty once nothing is in flight.
    fn truncate_if_clean(&mut self) -> Result<()> {
        if !self.open_entries.is_empty() {
            return Ok(());
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file.sync_all()?;
        debug!(path = ?self.path, "Journal truncated");
        Ok(())
    }
}
