// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Startup recovery.
//!
//! Runs once per sensor before its first write after boot. Scans the
//! sensor's source directory, validates every file record-by-record,
//! quarantines what fails, integrates what survives into the source's
//! tracked-file table, and settles interrupted writes:
//!
//! - `sensor_{id}_seq_{N}.dat.tmp` — creation never committed; unlinked.
//! - journal `begin` without `commit` — same, resolved in the journal.
//! - `emergency_{id}.tmp` — power-down write aborted mid-record; unlinked.
//! - `emergency_{id}.partial` / `.complete` — integrated as spooled data.
//!   A `.complete` is downgraded to `.partial` so a later power-down can
//!   resume the same file without clobbering it.
//!
//! Individual file failures never abort recovery; only a directory-level
//! I/O failure surfaces `RecoveryFailed`.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::sector::SectorType;
use crate::sensor::SensorHandle;
use crate::source::UPLOAD_SOURCE_COUNT;
use crate::spool::file::{self, parse_spool_file_name, scan_spool_file};
use crate::spool::journal::Journal;
use crate::spool::{
    emergency, DiskReadCursor, FileFormat, SourceDiskState, TrackedFile, EMERGENCY_SEQUENCE,
};

/// What one sensor's recovery found.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub files_recovered: usize,
    pub records_recovered: u64,
    pub tmp_files_deleted: usize,
    pub files_quarantined: usize,
    pub emergency_records: u64,
}

/// Recover every on-disk file belonging to `handle` under this source.
pub fn recover_sensor(
    state: &mut SourceDiskState,
    journal: &Mutex<Journal>,
    handle: &SensorHandle,
    now_ms: u64,
) -> Result<RecoveryReport> {
    let sensor_id = handle.config.id;
    let mut report = RecoveryReport::default();

    let entries = std::fs::read_dir(&state.dir).map_err(|e| StoreError::RecoveryFailed {
        id: sensor_id,
        reason: format!("cannot scan {:?}: {e}", state.dir),
    })?;

    let mut spool_files: Vec<(u64, String)> = Vec::new();
    let mut tmp_files: Vec<String> = Vec::new();
    let mut emergency_files: Vec<(emergency::EmergencyPhase, String)> = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| StoreError::RecoveryFailed {
            id: sensor_id,
            reason: format!("directory entry: {e}"),
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((id, sequence, is_tmp)) = parse_spool_file_name(&name) {
            // Every file of this source bumps the sequence floor, not just
            // this sensor's; sequences are per source.
            state.next_sequence = state.next_sequence.max(sequence + 1);
            if id != sensor_id {
                continue;
            }
            if is_tmp {
                tmp_files.push(name);
            } else {
                spool_files.push((sequence, name));
            }
        } else if let Some((id, phase)) = emergency::parse_emergency_file_name(&name) {
            if id == sensor_id {
                emergency_files.push((phase, name));
            }
        }
    }

    // Interrupted creations: stray temp files and journal orphans.
    for name in tmp_files {
        let path = state.dir.join(&name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                report.tmp_files_deleted += 1;
                info!(file = %name, "Deleted aborted spool temp file");
            }
            Err(e) => warn!(file = %name, error = %e, "Could not delete temp file"),
        }
        let final_name = name.trim_end_matches(".tmp").to_string();
        journal.lock().resolve(state.source.dir_name(), &final_name)?;
    }
    let orphans: Vec<(String, String)> = journal
        .lock()
        .uncommitted()
        .filter(|(dir, name)| {
            dir == state.source.dir_name()
                && parse_spool_file_name(name).is_some_and(|(id, _, _)| id == sensor_id)
        })
        .cloned()
        .collect();
    for (dir, name) in orphans {
        // The temp file may already be gone; resolving is what matters.
        let _ = std::fs::remove_file(state.dir.join(format!("{name}.tmp")));
        journal.lock().resolve(&dir, &name)?;
    }

    // Validate and integrate normal spool files, oldest first.
    spool_files.sort();
    for (sequence, name) in spool_files {
        if state.file_mut(sensor_id, sequence).is_some() {
            continue;
        }
        let path = state.dir.join(&name);
        let scanned = match scan_spool_file(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!(file = %name, error = %e, "Spool file unreadable, skipping");
                continue;
            }
        };
        if scanned.records.is_empty() {
            match file::quarantine(&path) {
                Ok(_) => {
                    report.files_quarantined += 1;
                    state.stats.files_quarantined += 1;
                    warn!(file = %name, "Spool file failed validation, quarantined");
                }
                Err(e) => warn!(file = %name, error = %e, "Quarantine move failed"),
            }
            continue;
        }
        if scanned.truncated {
            warn!(file = %name, kept = scanned.records.len(),
                "Spool file has a torn tail, keeping valid prefix");
        }
        let value_total = scanned.record_total();
        state.track(TrackedFile {
            filename: name,
            sequence,
            sensor_id,
            format: FileFormat::Spool,
            size_bytes: (scanned.records.len() * file::SPOOL_RECORD_BYTES) as u64,
            created_ms: now_ms,
            active: false,
            readable: true,
            validated: true,
            sector_records: scanned.records.len() as u32,
            value_total,
            record_counts: scanned.records.iter().map(|r| r.header.record_count).collect(),
            sector_type: scanned.records[0].header.sector_type,
            delivered: [0; UPLOAD_SOURCE_COUNT],
            acked: [0; UPLOAD_SOURCE_COUNT],
            read_by: [false; UPLOAD_SOURCE_COUNT],
            released: 0,
            needs_utc_backfill: scanned.records.iter().any(|r| !r.header.utc_known),
        });
        report.files_recovered += 1;
        report.records_recovered += value_total as u64;
    }

    // Emergency files.
    for (phase, name) in emergency_files {
        let path = state.dir.join(&name);
        match phase {
            emergency::EmergencyPhase::Tmp => {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        report.tmp_files_deleted += 1;
                        info!(file = %name, "Deleted aborted emergency file");
                    }
                    Err(e) => warn!(file = %name, error = %e, "Could not delete emergency temp"),
                }
                continue;
            }
            emergency::EmergencyPhase::Partial | emergency::EmergencyPhase::Complete => {}
        }
        if state.file_mut(sensor_id, EMERGENCY_SEQUENCE).is_some() {
            continue;
        }
        let scanned = match emergency::scan_emergency_file(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!(file = %name, error = %e, "Emergency file unreadable, skipping");
                continue;
            }
        };
        // A deadline-expired flush can leave an empty file behind.
        if scanned.records.is_empty() {
            let _ = std::fs::remove_file(&path);
            continue;
        }
        if scanned.truncated {
            warn!(file = %name, kept = scanned.records.len(),
                "Emergency file has a torn tail, keeping valid prefix");
        }
        // Seal completes back to .partial so a later power-down resumes
        // the same file instead of clobbering it. If a .partial already
        // exists alongside, it wins the name and the complete stays put.
        let partial = state.dir.join(emergency::partial_name(sensor_id));
        let tracked_name = if phase == emergency::EmergencyPhase::Complete && !partial.exists() {
            std::fs::rename(&path, &partial)?;
            file::sync_dir(&state.dir)?;
            emergency::partial_name(sensor_id)
        } else {
            name
        };
        let value_total: u32 = scanned.records.iter().map(|r| r.record_count as u32).sum();
        let sector_type = scanned
            .records
            .first()
            .map_or(SectorType::Tsd, |r| r.sector_type);
        state.track(TrackedFile {
            filename: tracked_name,
            sequence: EMERGENCY_SEQUENCE,
            sensor_id,
            format: FileFormat::Emergency,
            size_bytes: (scanned.records.len() * emergency::EMERGENCY_RECORD_BYTES) as u64,
            created_ms: now_ms,
            active: false,
            readable: true,
            validated: true,
            sector_records: scanned.records.len() as u32,
            value_total,
            record_counts: scanned.records.iter().map(|r| r.record_count).collect(),
            sector_type,
            delivered: [0; UPLOAD_SOURCE_COUNT],
            acked: [0; UPLOAD_SOURCE_COUNT],
            read_by: [false; UPLOAD_SOURCE_COUNT],
            released: 0,
            needs_utc_backfill: false,
        });
        report.files_recovered += 1;
        report.records_recovered += value_total as u64;
        report.emergency_records += value_total as u64;
    }

    // Rebuild the sensor's disk totals and park its reader at the oldest
    // file.
    let total: u64 = state
        .files_for_sensor(sensor_id)
        .map(|f| (f.value_total - f.released) as u64)
        .sum();
    {
        let mut st = handle.state.lock();
        st.total_disk_records = total;
    }
    state
        .readers
        .insert((state.source, sensor_id), DiskReadCursor::default());

    info!(source = %state.source, sensor = sensor_id,
        files = report.files_recovered, records = report.records_recovered,
        emergency = report.emergency_records, "Sensor recovery complete");
    Ok(report)
}
