// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Emergency power-down spool.
//!
//! Bypasses the normal state machine: on a power-down notification the
//! caller drains each sensor's RAM chain straight to disk, fsyncing after
//! every sector — durability over throughput, the supply capacitors decide
//! the deadline. Record format is deliberately simpler than the spool
//! file's:
//!
//! ```text
//! [EmergencyHeader: 24 bytes]
//!   magic        : u32 = 0xDEADBEEF
//!   sector_id    : u32 (original RAM sector id)
//!   sector_type  : u8
//!   record_count : u8  (values/pairs in the payload)
//!   pad          : [u8; 2]
//!   timestamp_ms : u64
//!   checksum     : u32 (IEEE CRC32, payload only)
//! [payload: 32 bytes]
//! ```
//!
//! Rename protocol: the file is written as `emergency_{id}.tmp`, renamed
//! to `.partial` when writing stops, and on to `.complete` only when the
//! chain was fully drained. Recovery treats `.complete` and `.partial` as
//! spooled data and deletes stray `.tmp` files as aborted mid-write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::Result;
use crate::sector::{SectorId, SectorType, SECTOR_PAYLOAD_BYTES};
use crate::spool::file::{payload_crc, sync_dir};

pub const EMERGENCY_MAGIC: u32 = 0xDEAD_BEEF;
pub const EMERGENCY_HEADER_BYTES: usize = 24;
pub const EMERGENCY_RECORD_BYTES: usize = EMERGENCY_HEADER_BYTES + SECTOR_PAYLOAD_BYTES;

pub fn tmp_name(sensor_id: u32) -> String {
    format!("emergency_{sensor_id}.tmp")
}

pub fn partial_name(sensor_id: u32) -> String {
    format!("emergency_{sensor_id}.partial")
}

pub fn complete_name(sensor_id: u32) -> String {
    format!("emergency_{sensor_id}.complete")
}

/// Parse `emergency_{id}.{tmp,partial,complete}`.
pub fn parse_emergency_file_name(name: &str) -> Option<(u32, EmergencyPhase)> {
    let rest = name.strip_prefix("emergency_")?;
    let (id_str, phase) = rest.split_once('.')?;
    let phase = match phase {
        "tmp" => EmergencyPhase::Tmp,
        "partial" => EmergencyPhase::Partial,
        "complete" => EmergencyPhase::Complete,
        _ => return None,
    };
    Some((id_str.parse().ok()?, phase))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyPhase {
    Tmp,
    Partial,
    Complete,
}

/// One sector snapshot queued for the emergency flush.
#[derive(Debug, Clone)]
pub struct EmergencySector {
    pub sector_id: SectorId,
    pub sector_type: SectorType,
    pub record_count: u16,
    pub timestamp_ms: u64,
    pub payload: [u8; SECTOR_PAYLOAD_BYTES],
}

fn encode_header(sector: &EmergencySector) -> [u8; EMERGENCY_HEADER_BYTES] {
    let mut buf = [0u8; EMERGENCY_HEADER_BYTES];
    LittleEndian::write_u32(&mut buf[0..4], EMERGENCY_MAGIC);
    LittleEndian::write_u32(&mut buf[4..8], sector.sector_id as u32);
    buf[8] = sector.sector_type.wire_code();
    buf[9] = sector.record_count as u8;
    LittleEndian::write_u64(&mut buf[12..20], sector.timestamp_ms);
    LittleEndian::write_u32(&mut buf[20..24], payload_crc(&sector.payload));
    buf
}

/// Result of one emergency flush.
#[derive(Debug)]
pub struct EmergencyOutcome {
    /// Sectors durably written before the deadline.
    pub sectors_written: u32,
    /// Chain fully drained; the file was renamed `.complete`.
    pub complete: bool,
    pub path: PathBuf,
}

/// Drain `sectors` to `{dir}/emergency_{sensor_id}.*`, fsyncing after each
/// one, stopping at `deadline`. Resumes an existing `.partial` from an
/// earlier interrupted shutdown.
pub fn flush_sectors(
    dir: &Path,
    sensor_id: u32,
    sectors: &[EmergencySector],
    deadline: Instant,
) -> Result<EmergencyOutcome> {
    let tmp = dir.join(tmp_name(sensor_id));
    let partial = dir.join(partial_name(sensor_id));

    // Resume a .partial left by a previous interrupted shutdown.
    if partial.exists() {
        std::fs::rename(&partial, &tmp)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&tmp)?;

    let mut written: u32 = 0;
    for sector in sectors {
        if Instant::now() >= deadline {
            warn!(sensor = sensor_id, written, remaining = sectors.len() as u32 - written,
                "Emergency flush hit deadline");
            break;
        }
        file.write_all(&encode_header(sector))?;
        file.write_all(&sector.payload)?;
        // Per-sector durability: power can fail between any two sectors.
        file.sync_all()?;
        written += 1;
    }
    drop(file);

    let complete = written as usize == sectors.len();
    std::fs::rename(&tmp, &partial)?;
    sync_dir(dir)?;
    let path = if complete {
        let done = dir.join(complete_name(sensor_id));
        std::fs::rename(&partial, &done)?;
        sync_dir(dir)?;
        done
    } else {
        partial
    };
    debug!(sensor = sensor_id, written, complete, path = ?path, "Emergency flush finished");
    Ok(EmergencyOutcome { sectors_written: written, complete, path })
}

/// A sector recovered from an emergency file.
#[derive(Debug, Clone)]
pub struct EmergencyRecord {
    pub sector_id: u32,
    pub sector_type: SectorType,
    pub record_count: u16,
    pub timestamp_ms: u64,
    pub payload: [u8; SECTOR_PAYLOAD_BYTES],
}

#[derive(Debug)]
pub struct ScannedEmergencyFile {
    pub records: Vec<EmergencyRecord>,
    pub truncated: bool,
}

/// Sequentially scan an emergency file, keeping the valid prefix.
pub fn scan_emergency_file(path: &Path) -> Result<ScannedEmergencyFile> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(0))?;
    let mut records = Vec::new();
    let mut truncated = false;
    loop {
        let mut head = [0u8; EMERGENCY_HEADER_BYTES];
        match file.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if LittleEndian::read_u32(&head[0..4]) != EMERGENCY_MAGIC {
            truncated = true;
            break;
        }
        let Some(sector_type) = SectorType::from_wire_code(head[8]) else {
            truncated = true;
            break;
        };
        let record_count = head[9] as u16;
        if record_count == 0 || record_count > sector_type.capacity() {
            truncated = true;
            break;
        }
        let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
        if file.read_exact(&mut payload).is_err() {
            truncated = true;
            break;
        }
        if LittleEndian::read_u32(&head[20..24]) != payload_crc(&payload) {
            truncated = true;
            break;
        }
        records.push(EmergencyRecord {
            sector_id: LittleEndian::read_u32(&head[4..8]),
            sector_type,
            record_count,
            timestamp_ms: LittleEndian::read_u64(&head[12..20]),
            payload,
        });
    }
    Ok(ScannedEmergencyFile { records, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector;
    use std::time::Duration;

    fn sector_with(values: &[u32], first_utc: u64) -> EmergencySector {
        let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
        sector::tsd_stamp_first_utc(&mut payload, first_utc);
        for (i, v) in values.iter().enumerate() {
            sector::tsd_write_value(&mut payload, i as u16, *v);
        }
        EmergencySector {
            sector_id: 9,
            sector_type: SectorType::Tsd,
            record_count: values.len() as u16,
            timestamp_ms: first_utc,
            payload,
        }
    }

    #[test]
    fn flush_and_scan_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sectors = vec![sector_with(&[1, 2, 3], 100), sector_with(&[4], 4_000)];
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = flush_sectors(dir.path(), 7, &sectors, deadline).expect("flush");
        assert!(outcome.complete);
        assert_eq!(outcome.sectors_written, 2);
        assert!(outcome.path.ends_with(complete_name(7)));

        let scanned = scan_emergency_file(&outcome.path).expect("scan");
        assert_eq!(scanned.records.len(), 2);
        assert!(!scanned.truncated);
        assert_eq!(scanned.records[0].record_count, 3);
        assert_eq!(sector::tsd_first_utc(&scanned.records[1].payload), 4_000);
    }

    #[test]
    fn expired_deadline_leaves_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sectors = vec![sector_with(&[1], 100)];
        let deadline = Instant::now() - Duration::from_millis(1);
        let outcome = flush_sectors(dir.path(), 7, &sectors, deadline).expect("flush");
        assert!(!outcome.complete);
        assert_eq!(outcome.sectors_written, 0);
        assert!(outcome.path.ends_with(partial_name(7)));
    }

    #[test]
    fn resume_appends_to_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deadline = Instant::now() + Duration::from_secs(5);
        // First shutdown got one sector out before dying.
        std::fs::write(
            dir.path().join(partial_name(3)),
            {
                let s = sector_with(&[9], 50);
                let mut raw = encode_header(&s).to_vec();
                raw.extend_from_slice(&s.payload);
                raw
            },
        )
        .expect("seed partial");

        let outcome =
            flush_sectors(dir.path(), 3, &[sector_with(&[10, 11], 60)], deadline).expect("flush");
        assert!(outcome.complete);
        let scanned = scan_emergency_file(&outcome.path).expect("scan");
        assert_eq!(scanned.records.len(), 2);
        assert_eq!(scanned.records[0].record_count, 1);
        assert_eq!(scanned.records[1].record_count, 2);
    }

    #[test]
    fn scan_stops_at_corrupt_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome =
            flush_sectors(dir.path(), 5, &[sector_with(&[1, 2], 10)], deadline).expect("flush");
        let mut raw = std::fs::read(&outcome.path).expect("read");
        let bad = sector_with(&[3], 20);
        let mut tail = encode_header(&bad).to_vec();
        tail.extend_from_slice(&bad.payload);
        tail[20] ^= 0xFF; // break the checksum
        raw.extend_from_slice(&tail);
        std::fs::write(&outcome.path, &raw).expect("write");

        let scanned = scan_emergency_file(&outcome.path).expect("scan");
        assert_eq!(scanned.records.len(), 1);
        assert!(scanned.truncated);
    }
}
