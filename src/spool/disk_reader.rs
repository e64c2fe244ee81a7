// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-source disk read cursors.
//!
//! `read_bulk` drains a sensor's disk stream before touching RAM: files in
//! sequence order, sector records in file order, values in record order.
//! Each reading lane keeps its own cursor, so one lane acking (and the
//! file eventually being unlinked) moves the data out from under slower
//! lanes — upload lanes share one copy of the data.
//!
//! Disk-level read errors are suppressed: the bad file is skipped, the
//! error counted in stats, and the cursor hops to the next sequence.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use tracing::warn;

use crate::error::Result;
#[cfg(test)]
use crate::sector::SectorType;
use crate::sector::{self, TsdEvtValue, SECTOR_PAYLOAD_BYTES};
use crate::source::UploadSource;
use crate::spool::file::SPOOL_HEADER_BYTES;
use crate::spool::{emergency, DiskReadCursor, FileFormat, SourceDiskState, TrackedFile};

/// Read one sector payload out of a tracked file.
fn read_payload_at(
    state: &SourceDiskState,
    file: &TrackedFile,
    record_index: u32,
) -> Result<[u8; SECTOR_PAYLOAD_BYTES]> {
    let path = state.dir.join(&file.filename);
    let header_bytes = match file.format {
        FileFormat::Spool => SPOOL_HEADER_BYTES as u64,
        FileFormat::Emergency => emergency::EMERGENCY_HEADER_BYTES as u64,
    };
    let offset = record_index as u64 * file.format.record_bytes() + header_bytes;
    let mut f = File::open(&path)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
    f.read_exact(&mut payload)?;
    Ok(payload)
}

/// Deliver up to `max` values for `(reading, sensor_id)` from disk into
/// `out`. Advances the lane's cursor and per-file delivered counts.
/// Returns the number of values delivered.
pub fn read_values(
    state: &mut SourceDiskState,
    reading: UploadSource,
    sensor_id: u32,
    sample_rate_ms: u64,
    out: &mut Vec<TsdEvtValue>,
    max: usize,
) -> u32 {
    let mut cursor = state
        .readers
        .get(&(reading, sensor_id))
        .copied()
        .unwrap_or_default();
    let mut delivered: u32 = 0;

    while (delivered as usize) < max {
        let Some(file) = state.next_file_at_or_after(sensor_id, cursor.sequence) else {
            break;
        };
        if file.sequence != cursor.sequence {
            // The file the cursor sat in was unlinked; resume at the next.
            cursor = DiskReadCursor { sequence: file.sequence, record_index: 0, value_index: 0 };
        }
        if cursor.record_index >= file.sector_records {
            match cursor.sequence.checked_add(1) {
                Some(next) => {
                    cursor = DiskReadCursor { sequence: next, record_index: 0, value_index: 0 };
                    continue;
                }
                None => break,
            }
        }
        let record_count = file.record_counts[cursor.record_index as usize];
        let sector_type = file.sector_type;
        let sequence = file.sequence;
        let payload = match read_payload_at(state, file, cursor.record_index) {
            Ok(p) => p,
            Err(e) => {
                warn!(source = %state.source, sensor = sensor_id, sequence,
                    error = %e, "Disk read failed, skipping file");
                state.stats.read_errors += 1;
                match sequence.checked_add(1) {
                    Some(next) => {
                        cursor = DiskReadCursor { sequence: next, record_index: 0, value_index: 0 };
                        continue;
                    }
                    None => break,
                }
            }
        };
        let mut taken: u32 = 0;
        while cursor.value_index < record_count && (delivered as usize) < max {
            out.push(sector::read_record(sector_type, &payload, cursor.value_index, sample_rate_ms));
            cursor.value_index += 1;
            delivered += 1;
            taken += 1;
        }
        if cursor.value_index >= record_count {
            cursor.record_index += 1;
            cursor.value_index = 0;
        }
        if taken > 0 {
            let idx = reading.index();
            if let Some(file) = state.file_mut(sensor_id, sequence) {
                file.delivered[idx] += taken;
                file.read_by[idx] = true;
            }
        }
    }

    state.readers.insert((reading, sensor_id), cursor);
    delivered
}

/// Reset the lane's cursor to its ack high-water: the oldest file with
/// unacked values, positioned just past them. Per-file delivered counts
/// roll back to the acked counts. Idempotent.
pub fn revert_cursor(state: &mut SourceDiskState, reading: UploadSource, sensor_id: u32) {
    let idx = reading.index();
    let mut cursor = DiskReadCursor::default();
    let mut positioned = false;
    let mut last_sequence: Option<u64> = None;
    let mut targets: Vec<(u64, u32)> = Vec::new();
    for file in state.files_for_sensor(sensor_id) {
        last_sequence = Some(file.sequence);
        if file.delivered[idx] != file.acked[idx] {
            targets.push((file.sequence, file.acked[idx]));
        }
        if !positioned && file.acked[idx] < file.value_total {
            let (record_index, value_index) = file.position_of(file.acked[idx]);
            cursor = DiskReadCursor { sequence: file.sequence, record_index, value_index };
            positioned = true;
        }
    }
    if !positioned {
        // Everything acked: park the cursor past the end of the newest
        // file so the next read hops forward instead of re-delivering.
        if let Some(last) = last_sequence {
            cursor = DiskReadCursor { sequence: last, record_index: u32::MAX, value_index: 0 };
        }
    }
    for (sequence, acked) in targets {
        if let Some(file) = state.file_mut(sensor_id, sequence) {
            file.delivered[idx] = acked;
        }
    }
    state.readers.insert((reading, sensor_id), cursor);
}

/// Ack `n` delivered values for `(reading, sensor_id)`, oldest first.
/// Files that become fully acked stay tracked; the spooler's cleanup
/// phase unlinks them. Returns `(acked, released)` — values acked for
/// this lane, and values released from the sensor's disk totals because
/// this lane was the first to ack them.
pub fn erase_values(
    state: &mut SourceDiskState,
    reading: UploadSource,
    sensor_id: u32,
    n: u32,
) -> (u32, u32) {
    let idx = reading.index();
    let mut remaining = n;
    let mut released = 0u32;
    for file in state.tracked.iter_mut() {
        if remaining == 0 {
            break;
        }
        if file.sensor_id != sensor_id || !file.readable {
            continue;
        }
        let outstanding = file.delivered[idx] - file.acked[idx];
        let take = outstanding.min(remaining);
        file.acked[idx] += take;
        remaining -= take;
        if file.acked[idx] > file.released {
            released += file.acked[idx] - file.released;
            file.released = file.acked[idx];
        }
    }
    (n - remaining, released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::file::{
        payload_crc, spool_file_name, ActiveSpoolFile, SpoolRecord, SpoolRecordHeader,
    };
    use crate::source::UPLOAD_SOURCE_COUNT;

    fn tsd_record(sensor_id: u32, first_utc: u64, values: &[u32]) -> SpoolRecord {
        let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
        sector::tsd_stamp_first_utc(&mut payload, first_utc);
        for (i, v) in values.iter().enumerate() {
            sector::tsd_write_value(&mut payload, i as u16, *v);
        }
        SpoolRecord {
            header: SpoolRecordHeader {
                sector_type: SectorType::Tsd,
                utc_known: true,
                owner_sensor_id: sensor_id,
                record_count: values.len() as u16,
                first_utc_ms: first_utc,
                last_utc_ms: first_utc + (values.len() as u64 - 1) * 1_000,
                data_size: SECTOR_PAYLOAD_BYTES as u16,
                original_sector_id: 0,
                crc32: payload_crc(&payload),
            },
            payload,
        }
    }

    fn write_file(
        state: &mut SourceDiskState,
        sensor_id: u32,
        sequence: u64,
        records: Vec<SpoolRecord>,
    ) {
        let mut active = ActiveSpoolFile::create(&state.dir, sensor_id, sequence).expect("create");
        active.append_batch(&records).expect("append");
        active.commit_rename().expect("rename");
        state.track(TrackedFile {
            filename: spool_file_name(sensor_id, sequence),
            sequence,
            sensor_id,
            format: FileFormat::Spool,
            size_bytes: active.bytes_written,
            created_ms: 0,
            active: false,
            readable: true,
            validated: true,
            sector_records: records.len() as u32,
            value_total: records.iter().map(|r| r.header.record_count as u32).sum(),
            record_counts: records.iter().map(|r| r.header.record_count).collect(),
            sector_type: SectorType::Tsd,
            delivered: [0; UPLOAD_SOURCE_COUNT],
            acked: [0; UPLOAD_SOURCE_COUNT],
            read_by: [false; UPLOAD_SOURCE_COUNT],
            released: 0,
            needs_utc_backfill: false,
        });
    }

    fn gateway_state(dir: &std::path::Path) -> SourceDiskState {
        SourceDiskState::new(UploadSource::Gateway, dir).expect("state")
    }

    #[test]
    fn reads_across_files_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = gateway_state(dir.path());
        write_file(&mut state, 1, 0, vec![tsd_record(1, 1_000, &[10, 11, 12])]);
        write_file(&mut state, 1, 1, vec![tsd_record(1, 4_000, &[13, 14])]);

        let mut out = Vec::new();
        let n = read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut out, 10);
        assert_eq!(n, 5);
        let values: Vec<u32> = out.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![10, 11, 12, 13, 14]);
        let stamps: Vec<u64> = out.iter().map(|r| r.utc_ms).collect();
        assert_eq!(stamps, vec![1_000, 2_000, 3_000, 4_000, 5_000]);
    }

    #[test]
    fn partial_read_resumes_where_it_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = gateway_state(dir.path());
        write_file(&mut state, 1, 0, vec![tsd_record(1, 1_000, &[10, 11, 12, 13])]);

        let mut out = Vec::new();
        assert_eq!(read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut out, 2), 2);
        assert_eq!(read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut out, 10), 2);
        let values: Vec<u32> = out.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![10, 11, 12, 13]);
    }

    #[test]
    fn revert_replays_unacked_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = gateway_state(dir.path());
        write_file(&mut state, 1, 0, vec![tsd_record(1, 1_000, &[10, 11, 12])]);

        let mut out = Vec::new();
        read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut out, 3);
        assert_eq!(erase_values(&mut state, UploadSource::Gateway, 1, 1), (1, 1));
        revert_cursor(&mut state, UploadSource::Gateway, 1);
        // Revert twice — must be idempotent.
        revert_cursor(&mut state, UploadSource::Gateway, 1);

        let mut replay = Vec::new();
        let n = read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut replay, 10);
        assert_eq!(n, 2);
        assert_eq!(replay[0].value, 11);
        assert_eq!(replay[1].value, 12);
    }

    #[test]
    fn lanes_keep_independent_cursors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = gateway_state(dir.path());
        write_file(&mut state, 1, 0, vec![tsd_record(1, 1_000, &[10, 11])]);

        let mut a = Vec::new();
        read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut a, 2);
        let mut b = Vec::new();
        let n = read_values(&mut state, UploadSource::Hosted, 1, 1_000, &mut b, 2);
        assert_eq!(n, 2);
        assert_eq!(b[0].value, 10);
        let f = &state.tracked[0];
        assert!(f.read_by[UploadSource::Gateway.index()]);
        assert!(f.read_by[UploadSource::Hosted.index()]);
    }

    #[test]
    fn fully_acked_file_is_flagged_for_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = gateway_state(dir.path());
        write_file(&mut state, 1, 0, vec![tsd_record(1, 1_000, &[10, 11])]);

        let mut out = Vec::new();
        read_values(&mut state, UploadSource::Gateway, 1, 1_000, &mut out, 2);
        assert_eq!(erase_values(&mut state, UploadSource::Gateway, 1, 2), (2, 2));
        assert!(state.tracked[0].fully_acked());
    }
}
