// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Disk spool subsystem — per-upload-source state, file formats, the
//! tick-driven spool state machine, emergency power-down flush, and
//! startup recovery.
//!
//! Disk state is device-level: one record per upload source, not per
//! sensor. File descriptors, tracked-file tables and the spool machine all
//! live here, guarded by one lock per source. A sensor's spool files land
//! under its own source's directory; any upload lane may read them.

pub mod disk_reader;
pub mod emergency;
pub mod file;
pub mod journal;
pub mod machine;
pub mod recovery;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::sector::SectorType;
use crate::source::{UploadSource, UPLOAD_SOURCE_COUNT};
use file::{ActiveSpoolFile, SPOOL_RECORD_BYTES};

/// Sequence assigned to a sensor's emergency file so it sorts after every
/// normal spool file.
pub const EMERGENCY_SEQUENCE: u64 = u64::MAX;

/// On-disk format of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileFormat {
    /// `sensor_{id}_seq_{N}.dat` — 40-byte headers.
    Spool,
    /// `emergency_{id}.{partial,complete}` — 24-byte headers.
    Emergency,
}

impl FileFormat {
    pub fn record_bytes(self) -> u64 {
        match self {
            FileFormat::Spool => SPOOL_RECORD_BYTES as u64,
            FileFormat::Emergency => emergency::EMERGENCY_RECORD_BYTES as u64,
        }
    }
}

/// One validated on-disk file holding a sensor's spooled sectors.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    pub filename: String,
    pub sequence: u64,
    pub sensor_id: u32,
    pub format: FileFormat,
    pub size_bytes: u64,
    pub created_ms: u64,
    /// Still open for appending by the spooler.
    pub active: bool,
    /// Renamed into place and scannable.
    pub readable: bool,
    /// Every record passed CRC validation.
    pub validated: bool,
    /// Sector records (header + payload) in the file.
    pub sector_records: u32,
    /// Individual values/pairs across all sector records.
    pub value_total: u32,
    /// Per-record value counts, indexed by sector record position.
    pub record_counts: Vec<u16>,
    pub sector_type: SectorType,
    /// Values delivered to each upload source, as a positional prefix.
    pub delivered: [u32; UPLOAD_SOURCE_COUNT],
    /// Values acked by each upload source, as a positional prefix.
    pub acked: [u32; UPLOAD_SOURCE_COUNT],
    /// Whether each source has ever read from this file.
    pub read_by: [bool; UPLOAD_SOURCE_COUNT],
    /// Global ack high-water: the first lane to ack a value releases it
    /// from the per-sensor disk totals.
    pub released: u32,
    /// Any record still carries `utc_known = false`.
    pub needs_utc_backfill: bool,
}

impl TrackedFile {
    /// A file leaves disk only once every lane that read from it has acked
    /// everything it holds.
    pub fn fully_acked(&self) -> bool {
        let mut any_reader = false;
        for idx in 0..UPLOAD_SOURCE_COUNT {
            if self.read_by[idx] {
                any_reader = true;
                if self.acked[idx] < self.value_total {
                    return false;
                }
            }
        }
        any_reader
    }

    /// Values not yet acked by `source`.
    pub fn unacked(&self, source: UploadSource) -> u32 {
        self.value_total - self.acked[source.index()]
    }

    /// Translate a positional value offset into `(record_index, value_index)`.
    pub fn position_of(&self, value_offset: u32) -> (u32, u16) {
        let mut remaining = value_offset;
        for (record_index, count) in self.record_counts.iter().enumerate() {
            if remaining < *count as u32 {
                return (record_index as u32, remaining as u16);
            }
            remaining -= *count as u32;
        }
        (self.record_counts.len() as u32, 0)
    }
}

/// A lane's read position within one sensor's disk stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskReadCursor {
    /// Sequence of the file being read.
    pub sequence: u64,
    /// Sector record index within that file.
    pub record_index: u32,
    /// Value index within that sector record.
    pub value_index: u16,
}

/// Per-source spool statistics (`get_stats`).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceStats {
    pub sectors_spooled: u64,
    pub files_created: u64,
    pub files_deleted: u64,
    pub files_quarantined: u64,
    /// Unacked records destroyed by the space-budget force delete.
    pub records_lost: u64,
    pub emergency_sectors: u64,
    pub backfilled_records: u64,
    pub spooler_stalls: u64,
    pub read_errors: u64,
}

/// Device-global disk state for one upload source. Guarded by one
/// `parking_lot::Mutex` in the engine; never lock a sensor or the pool
/// while holding it across I/O.
pub struct SourceDiskState {
    pub source: UploadSource,
    pub dir: PathBuf,
    /// Next spool file sequence for this source.
    pub next_sequence: u64,
    /// The file currently being filled, if any.
    pub active: Option<ActiveSpoolFile>,
    /// All known files, sorted by `(sensor_id, sequence)` lookups via scan;
    /// kept in ascending sequence order.
    pub tracked: Vec<TrackedFile>,
    /// Read cursors keyed by `(reading source, sensor id)`.
    pub readers: HashMap<(UploadSource, u32), DiskReadCursor>,
    pub machine: machine::SpoolMachine,
    pub stats: SourceStats,
}

impl SourceDiskState {
    pub fn new(source: UploadSource, base: &Path) -> Result<Self> {
        let dir = base.join(source.dir_name());
        std::fs::create_dir_all(&dir)?;
        Ok(SourceDiskState {
            source,
            dir,
            next_sequence: 0,
            active: None,
            tracked: Vec::new(),
            readers: HashMap::new(),
            machine: machine::SpoolMachine::default(),
            stats: SourceStats::default(),
        })
    }

    /// Total spool bytes currently on disk for this source.
    pub fn total_bytes(&self) -> u64 {
        self.tracked.iter().map(|f| f.size_bytes).sum()
    }

    /// Insert keeping ascending sequence order (emergency files last).
    pub fn track(&mut self, file: TrackedFile) {
        let at = self
            .tracked
            .partition_point(|f| (f.sequence, f.sensor_id) <= (file.sequence, file.sensor_id));
        self.tracked.insert(at, file);
    }

    /// Readable files for `sensor_id` in sequence order.
    pub fn files_for_sensor(&self, sensor_id: u32) -> impl Iterator<Item = &TrackedFile> {
        self.tracked
            .iter()
            .filter(move |f| f.sensor_id == sensor_id && f.readable)
    }

    pub fn file_mut(&mut self, sensor_id: u32, sequence: u64) -> Option<&mut TrackedFile> {
        self.tracked
            .iter_mut()
            .find(|f| f.sensor_id == sensor_id && f.sequence == sequence)
    }

    /// First readable file for `sensor_id` with `sequence >= from`, the
    /// skip-deleted hop the read cursor relies on.
    pub fn next_file_at_or_after(&self, sensor_id: u32, from: u64) -> Option<&TrackedFile> {
        self.files_for_sensor(sensor_id).find(|f| f.sequence >= from)
    }

    /// Unacked disk values for `(source, sensor_id)` — what a lane can
    /// still read from disk.
    pub fn unread_values(&self, reading: UploadSource, sensor_id: u32) -> u64 {
        self.files_for_sensor(sensor_id)
            .map(|f| (f.value_total - f.delivered[reading.index()]) as u64)
            .sum()
    }

    /// Drop a file from tracking and unlink it. Returns its unacked value
    /// count (non-zero only for force deletes).
    pub fn untrack_and_unlink(&mut self, sensor_id: u32, sequence: u64) -> Result<u64> {
        let Some(pos) = self
            .tracked
            .iter()
            .position(|f| f.sensor_id == sensor_id && f.sequence == sequence)
        else {
            return Ok(0);
        };
        let tracked = self.tracked.remove(pos);
        let lost: u64 = if tracked.fully_acked() {
            0
        } else {
            tracked.value_total as u64
                - tracked
                    .acked
                    .iter()
                    .zip(&tracked.read_by)
                    .filter(|(_, read)| **read)
                    .map(|(a, _)| *a as u64)
                    .max()
                    .unwrap_or(0)
        };
        let path = self.dir.join(&tracked.filename);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        file::sync_dir(&self.dir)?;
        self.stats.files_deleted += 1;
        tracing::debug!(source = %self.source, file = %tracked.filename, lost, "Spool file unlinked");
        Ok(lost)
    }
}
