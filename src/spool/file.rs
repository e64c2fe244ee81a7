// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Spool file format and I/O.
//!
//! A spool file is a sequence of fixed-size records, each a 40-byte packed
//! little-endian header followed by one 32-byte sector payload:
//!
//! ```text
//! [RecordHeader: 40 bytes]
//!   magic              : u32  = 0xDEAD5EC7
//!   sector_type        : u8   (1 = TSD, 2 = EVT)
//!   conversion_status  : u8   (1 = UTC known at write time)
//!   format_version     : u8   = 1
//!   pad                : u8
//!   owner_sensor_id    : u32
//!   record_count       : u16  (values/pairs in the payload)
//!   first_utc_ms       : u64
//!   last_utc_ms        : u64
//!   data_size          : u16  (payload bytes, always 32)
//!   original_sector_id : u32
//!   crc32              : u32  (IEEE, payload region only)
//! [payload: 32 bytes]
//! ```
//!
//! Files are named `sensor_{id}_seq_{N}.dat`. The id in the name is
//! redundant; each record header carries the owning sensor. A new file is
//! born as `.dat.tmp`, filled with its first batch, fsynced, then renamed
//! into place with a directory sync. Later batches append to the renamed
//! file with an fsync per batch, so a crash can only cost the unsynced
//! tail, which the recovery scan drops record-by-record.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::sector::{SectorType, SECTOR_PAYLOAD_BYTES};

pub const SPOOL_MAGIC: u32 = 0xDEAD_5EC7;
pub const SPOOL_FORMAT_VERSION: u8 = 1;
pub const SPOOL_HEADER_BYTES: usize = 40;
pub const SPOOL_RECORD_BYTES: usize = SPOOL_HEADER_BYTES + SECTOR_PAYLOAD_BYTES;

/// Quarantine subdirectory for files that fail validation.
pub const CORRUPTED_DIR: &str = "corrupted";

/// IEEE CRC32 over a sector payload.
pub fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// One record header as written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolRecordHeader {
    pub sector_type: SectorType,
    /// True when UTC was known at write time; false marks the record for a
    /// later backfill pass.
    pub utc_known: bool,
    pub owner_sensor_id: u32,
    pub record_count: u16,
    pub first_utc_ms: u64,
    pub last_utc_ms: u64,
    pub data_size: u16,
    pub original_sector_id: u32,
    pub crc32: u32,
}

impl SpoolRecordHeader {
    pub fn encode(&self) -> [u8; SPOOL_HEADER_BYTES] {
        let mut buf = [0u8; SPOOL_HEADER_BYTES];
        LittleEndian::write_u32(&mut buf[0..4], SPOOL_MAGIC);
        buf[4] = self.sector_type.wire_code();
        buf[5] = self.utc_known as u8;
        buf[6] = SPOOL_FORMAT_VERSION;
        buf[7] = 0;
        LittleEndian::write_u32(&mut buf[8..12], self.owner_sensor_id);
        LittleEndian::write_u16(&mut buf[12..14], self.record_count);
        LittleEndian::write_u64(&mut buf[14..22], self.first_utc_ms);
        LittleEndian::write_u64(&mut buf[22..30], self.last_utc_ms);
        LittleEndian::write_u16(&mut buf[30..32], self.data_size);
        LittleEndian::write_u32(&mut buf[32..36], self.original_sector_id);
        LittleEndian::write_u32(&mut buf[36..40], self.crc32);
        buf
    }

    /// Decode and validate magic + version. Payload CRC is checked by the
    /// caller against the bytes that follow.
    pub fn decode(buf: &[u8; SPOOL_HEADER_BYTES]) -> Result<Self> {
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != SPOOL_MAGIC {
            return Err(StoreError::InvalidParameter(format!(
                "bad spool record magic {magic:#010x}"
            )));
        }
        let sector_type = SectorType::from_wire_code(buf[4]).ok_or_else(|| {
            StoreError::InvalidParameter(format!("unknown sector type code {}", buf[4]))
        })?;
        if buf[6] != SPOOL_FORMAT_VERSION {
            return Err(StoreError::InvalidParameter(format!(
                "unsupported spool format version {}",
                buf[6]
            )));
        }
        Ok(SpoolRecordHeader {
            sector_type,
            utc_known: buf[5] != 0,
            owner_sensor_id: LittleEndian::read_u32(&buf[8..12]),
            record_count: LittleEndian::read_u16(&buf[12..14]),
            first_utc_ms: LittleEndian::read_u64(&buf[14..22]),
            last_utc_ms: LittleEndian::read_u64(&buf[22..30]),
            data_size: LittleEndian::read_u16(&buf[30..32]),
            original_sector_id: LittleEndian::read_u32(&buf[32..36]),
            crc32: LittleEndian::read_u32(&buf[36..40]),
        })
    }
}

/// One complete spool record (header + payload) in memory.
#[derive(Debug, Clone)]
pub struct SpoolRecord {
    pub header: SpoolRecordHeader,
    pub payload: [u8; SECTOR_PAYLOAD_BYTES],
}

impl SpoolRecord {
    /// CRC consistency of this record.
    pub fn crc_ok(&self) -> bool {
        self.header.crc32 == payload_crc(&self.payload)
    }
}

pub fn spool_file_name(sensor_id: u32, sequence: u64) -> String {
    format!("sensor_{sensor_id}_seq_{sequence}.dat")
}

/// Parse `sensor_{id}_seq_{N}.dat` (optionally with a `.tmp` suffix).
/// Returns `(sensor_id, sequence, is_tmp)`.
pub fn parse_spool_file_name(name: &str) -> Option<(u32, u64, bool)> {
    let (stem, is_tmp) = match name.strip_suffix(".tmp") {
        Some(stem) => (stem, true),
        None => (name, false),
    };
    let stem = stem.strip_suffix(".dat")?;
    let rest = stem.strip_prefix("sensor_")?;
    let (id_str, seq_str) = rest.split_once("_seq_")?;
    Some((id_str.parse().ok()?, seq_str.parse().ok()?, is_tmp))
}

/// fsync a directory so a rename inside it is durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// The spool file currently being filled for one sensor.
#[derive(Debug)]
pub struct ActiveSpoolFile {
    file: File,
    /// Current on-disk path (`.tmp` until the first batch is committed).
    path: PathBuf,
    dir: PathBuf,
    pub sensor_id: u32,
    pub sequence: u64,
    pub bytes_written: u64,
    pub record_total: u32,
    renamed: bool,
}

impl ActiveSpoolFile {
    /// Create `sensor_{id}_seq_{N}.dat.tmp`, failing if it already exists.
    pub fn create(dir: &Path, sensor_id: u32, sequence: u64) -> Result<Self> {
        let path = dir.join(format!("{}.tmp", spool_file_name(sensor_id, sequence)));
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        debug!(path = ?path, "Spool file created");
        Ok(ActiveSpoolFile {
            file,
            path,
            dir: dir.to_path_buf(),
            sensor_id,
            sequence,
            bytes_written: 0,
            record_total: 0,
            renamed: false,
        })
    }

    pub fn is_renamed(&self) -> bool {
        self.renamed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn final_path(&self) -> PathBuf {
        self.dir.join(spool_file_name(self.sensor_id, self.sequence))
    }

    /// Append a batch with one gather write, then fsync. Returns the byte
    /// offset the batch starts at, for verification.
    pub fn append_batch(&mut self, records: &[SpoolRecord]) -> Result<u64> {
        let offset = self.bytes_written;
        let mut headers = Vec::with_capacity(records.len());
        for rec in records {
            headers.push(rec.header.encode());
        }
        let mut slices = Vec::with_capacity(records.len() * 2);
        for (head, rec) in headers.iter().zip(records) {
            slices.push(IoSlice::new(head));
            slices.push(IoSlice::new(&rec.payload));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        write_all_vectored(&mut self.file, &mut slices)?;
        self.file.sync_all()?;
        self.bytes_written += (records.len() * SPOOL_RECORD_BYTES) as u64;
        self.record_total += records.iter().map(|r| r.header.record_count as u32).sum::<u32>();
        Ok(offset)
    }

    /// Rename `.tmp` into its final name and sync the directory. Called
    /// once, after the first batch is durable.
    pub fn commit_rename(&mut self) -> Result<()> {
        let final_path = self.final_path();
        std::fs::rename(&self.path, &final_path)?;
        sync_dir(&self.dir)?;
        self.path = final_path;
        self.renamed = true;
        Ok(())
    }

    /// Re-read the batch at `offset` and compare payload CRCs against the
    /// headers.
    pub fn verify_batch(&mut self, offset: u64, record_count: usize) -> Result<bool> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; record_count * SPOOL_RECORD_BYTES];
        self.file.read_exact(&mut buf)?;
        for chunk in buf.chunks_exact(SPOOL_RECORD_BYTES) {
            let mut head = [0u8; SPOOL_HEADER_BYTES];
            head.copy_from_slice(&chunk[..SPOOL_HEADER_BYTES]);
            let header = SpoolRecordHeader::decode(&head)?;
            if header.crc32 != payload_crc(&chunk[SPOOL_HEADER_BYTES..]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rewrite the header at `record_index` in place. Used by the UTC
    /// backfill pass; the payload is untouched so the CRC stands.
    pub fn rewrite_header(&mut self, record_index: u32, header: &SpoolRecordHeader) -> Result<()> {
        let offset = record_index as u64 * SPOOL_RECORD_BYTES as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn write_all_vectored(file: &mut File, slices: &mut [IoSlice<'_>]) -> Result<()> {
    // Vectored writes may be partial; fall back to flattening on a short
    // write rather than tracking slice advancement by hand.
    let total: usize = slices.iter().map(|s| s.len()).sum();
    let written = file.write_vectored(slices)?;
    if written == total {
        return Ok(());
    }
    let mut flat = Vec::with_capacity(total);
    for s in slices.iter() {
        flat.extend_from_slice(s);
    }
    file.seek(SeekFrom::Current(-(written as i64)))?;
    file.write_all(&flat)?;
    Ok(())
}

/// Outcome of scanning one spool file.
#[derive(Debug)]
pub struct ScannedSpoolFile {
    pub records: Vec<SpoolRecord>,
    /// True when the scan stopped at a corrupt or truncated record.
    pub truncated: bool,
}

impl ScannedSpoolFile {
    pub fn record_total(&self) -> u32 {
        self.records.iter().map(|r| r.header.record_count as u32).sum()
    }
}

/// Sequentially scan a spool file, stopping at the first record that fails
/// magic, version, or CRC validation. The valid prefix is kept; the caller
/// decides whether a truncated file is quarantined or trusted as-is.
pub fn scan_spool_file(path: &Path) -> Result<ScannedSpoolFile> {
    let mut file = File::open(path)?;
    let mut records = Vec::new();
    let mut truncated = false;
    loop {
        let mut head = [0u8; SPOOL_HEADER_BYTES];
        match file.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let header = match SpoolRecordHeader::decode(&head) {
            Ok(h) => h,
            Err(_) => {
                truncated = true;
                break;
            }
        };
        let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
        if file.read_exact(&mut payload).is_err() {
            truncated = true;
            break;
        }
        let record = SpoolRecord { header, payload };
        if !record.crc_ok() {
            truncated = true;
            break;
        }
        records.push(record);
    }
    debug!(path = ?path, records = records.len(), truncated, "Spool file scanned");
    Ok(ScannedSpoolFile { records, truncated })
}

/// Move a failed file into the `corrupted/` quarantine next to it.
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let dir = path.parent().ok_or_else(|| {
        StoreError::InvalidParameter(format!("no parent directory for {path:?}"))
    })?;
    let quarantine_dir = dir.join(CORRUPTED_DIR);
    std::fs::create_dir_all(&quarantine_dir)?;
    let name = path.file_name().ok_or_else(|| {
        StoreError::InvalidParameter(format!("no file name in {path:?}"))
    })?;
    let dest = quarantine_dir.join(name);
    std::fs::rename(path, &dest)?;
    sync_dir(dir)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector;

    fn sample_record(sensor_id: u32, first_utc: u64) -> SpoolRecord {
        let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
        sector::tsd_stamp_first_utc(&mut payload, first_utc);
        for i in 0..sector::TSD_VALUES_PER_SECTOR {
            sector::tsd_write_value(&mut payload, i, 900 + i as u32);
        }
        SpoolRecord {
            header: SpoolRecordHeader {
                sector_type: SectorType::Tsd,
                utc_known: true,
                owner_sensor_id: sensor_id,
                record_count: sector::TSD_VALUES_PER_SECTOR,
                first_utc_ms: first_utc,
                last_utc_ms: first_utc + 5_000,
                data_size: SECTOR_PAYLOAD_BYTES as u16,
                original_sector_id: 17,
                crc32: payload_crc(&payload),
            },
            payload,
        }
    }

    #[test]
    fn header_codec_round_trips() {
        let rec = sample_record(12, 1_000);
        let decoded = SpoolRecordHeader::decode(&rec.header.encode()).expect("decode");
        assert_eq!(decoded, rec.header);
    }

    #[test]
    fn decode_rejects_bad_magic_and_version() {
        let rec = sample_record(12, 1_000);
        let mut buf = rec.header.encode();
        buf[0] ^= 0xFF;
        assert!(SpoolRecordHeader::decode(&buf).is_err());
        let mut buf = rec.header.encode();
        buf[6] = 9;
        assert!(SpoolRecordHeader::decode(&buf).is_err());
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(parse_spool_file_name(&spool_file_name(3, 41)), Some((3, 41, false)));
        assert_eq!(parse_spool_file_name("sensor_3_seq_41.dat.tmp"), Some((3, 41, true)));
        assert_eq!(parse_spool_file_name("emergency_3.complete"), None);
        assert_eq!(parse_spool_file_name("sensor_x_seq_1.dat"), None);
    }

    #[test]
    fn append_commit_scan_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSpoolFile::create(dir.path(), 12, 0).expect("create");
        let batch = vec![sample_record(12, 1_000), sample_record(12, 7_000)];
        let offset = active.append_batch(&batch).expect("append");
        assert_eq!(offset, 0);
        assert!(active.verify_batch(offset, batch.len()).expect("verify"));
        active.commit_rename().expect("rename");
        assert!(active.final_path().exists());

        let scanned = scan_spool_file(&active.final_path()).expect("scan");
        assert_eq!(scanned.records.len(), 2);
        assert!(!scanned.truncated);
        assert_eq!(scanned.record_total(), 12);
        assert_eq!(scanned.records[1].header.first_utc_ms, 7_000);
    }

    #[test]
    fn scan_keeps_valid_prefix_of_torn_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSpoolFile::create(dir.path(), 5, 1).expect("create");
        active.append_batch(&[sample_record(5, 100)]).expect("append");
        active.commit_rename().expect("rename");
        let path = active.final_path();
        drop(active);

        // Simulate a torn append: half a record at the tail.
        let mut raw = std::fs::read(&path).expect("read");
        let torn = sample_record(5, 200);
        raw.extend_from_slice(&torn.header.encode()[..20]);
        std::fs::write(&path, &raw).expect("write torn");

        let scanned = scan_spool_file(&path).expect("scan");
        assert_eq!(scanned.records.len(), 1);
        assert!(scanned.truncated);
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSpoolFile::create(dir.path(), 5, 2).expect("create");
        active.append_batch(&[sample_record(5, 100)]).expect("append");
        active.commit_rename().expect("rename");
        let path = active.final_path();

        let mut raw = std::fs::read(&path).expect("read");
        let len = raw.len();
        raw[len - 1] ^= 0xFF; // flip a payload byte
        std::fs::write(&path, &raw).expect("write corrupt");

        let scanned = scan_spool_file(&path).expect("scan");
        assert!(scanned.records.is_empty());
        assert!(scanned.truncated);
    }

    #[test]
    fn quarantine_moves_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sensor_1_seq_0.dat");
        std::fs::write(&path, b"junk").expect("write");
        let dest = quarantine(&path).expect("quarantine");
        assert!(!path.exists());
        assert!(dest.exists());
        assert!(dest.to_string_lossy().contains(CORRUPTED_DIR));
    }
}
