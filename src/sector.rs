// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Sector payload layouts.
//!
//! A sector is a bare 32-byte payload; all metadata (owner, link, flags)
//! lives in the parallel chain table, which is what keeps payload
//! efficiency at 75%. Two layouts share the same 32 bytes:
//!
//! ```text
//! TSD  [first_utc_ms: u64 LE][value0: u32 LE] … [value5: u32 LE]
//! EVT  [value0: u32][utc0: u64][value1: u32][utc1: u64][padding: u64]
//! ```
//!
//! TSD timestamps for values 1..6 are computed from `first_utc_ms` plus the
//! sensor's sample rate; EVT pairs each carry their own timestamp.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Index of a sector in the pool. 16-bit on the embedded profile.
#[cfg(feature = "compact-sector-ids")]
pub type SectorId = u16;
#[cfg(not(feature = "compact-sector-ids"))]
pub type SectorId = u32;

/// Chain terminator / "no sector" sentinel: the max value of the id width.
pub const NULL_SECTOR_ID: SectorId = SectorId::MAX;

/// Fixed payload size of every sector.
pub const SECTOR_PAYLOAD_BYTES: usize = 32;

/// Values held by a full TSD sector.
pub const TSD_VALUES_PER_SECTOR: u16 = 6;
/// Pairs held by a full EVT sector.
pub const EVT_PAIRS_PER_SECTOR: u16 = 2;

const TSD_FIRST_UTC_OFFSET: usize = 0;
const TSD_VALUES_OFFSET: usize = 8;
const EVT_PAIR_STRIDE: usize = 12;

/// What a sector holds. Stamped into the chain entry at allocation and into
/// every spool file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectorType {
    Tsd,
    Evt,
}

impl SectorType {
    /// On-disk code used in spool and emergency file headers.
    pub fn wire_code(self) -> u8 {
        match self {
            SectorType::Tsd => 1,
            SectorType::Evt => 2,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SectorType::Tsd),
            2 => Some(SectorType::Evt),
            _ => None,
        }
    }

    /// Records a full sector of this type holds.
    pub fn capacity(self) -> u16 {
        match self {
            SectorType::Tsd => TSD_VALUES_PER_SECTOR,
            SectorType::Evt => EVT_PAIRS_PER_SECTOR,
        }
    }

    /// Byte offset at which record `idx` is written.
    pub fn byte_offset(self, idx: u16) -> u16 {
        match self {
            SectorType::Tsd => (TSD_VALUES_OFFSET + idx as usize * 4) as u16,
            SectorType::Evt => (idx as usize * EVT_PAIR_STRIDE) as u16,
        }
    }

    /// Number of records a write offset corresponds to.
    pub fn records_at_offset(self, offset: u16) -> u16 {
        match self {
            SectorType::Tsd => {
                (offset as usize).saturating_sub(TSD_VALUES_OFFSET) as u16 / 4
            }
            SectorType::Evt => offset / EVT_PAIR_STRIDE as u16,
        }
    }
}

/// One record as delivered to the upload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TsdEvtValue {
    pub value: u32,
    pub utc_ms: u64,
}

// ────────────────────────────── TSD layout ──────────────────────────────

/// Stamp the first-value timestamp of a freshly allocated TSD sector.
pub fn tsd_stamp_first_utc(payload: &mut [u8], utc_ms: u64) {
    LittleEndian::write_u64(&mut payload[TSD_FIRST_UTC_OFFSET..TSD_FIRST_UTC_OFFSET + 8], utc_ms);
}

pub fn tsd_first_utc(payload: &[u8]) -> u64 {
    LittleEndian::read_u64(&payload[TSD_FIRST_UTC_OFFSET..TSD_FIRST_UTC_OFFSET + 8])
}

pub fn tsd_write_value(payload: &mut [u8], idx: u16, value: u32) {
    debug_assert!(idx < TSD_VALUES_PER_SECTOR);
    let off = TSD_VALUES_OFFSET + idx as usize * 4;
    LittleEndian::write_u32(&mut payload[off..off + 4], value);
}

pub fn tsd_value(payload: &[u8], idx: u16) -> u32 {
    debug_assert!(idx < TSD_VALUES_PER_SECTOR);
    let off = TSD_VALUES_OFFSET + idx as usize * 4;
    LittleEndian::read_u32(&payload[off..off + 4])
}

/// Timestamp of value `idx` in a TSD sector — computed, never stored.
pub fn tsd_timestamp(first_utc_ms: u64, idx: u16, sample_rate_ms: u64) -> u64 {
    first_utc_ms + idx as u64 * sample_rate_ms
}

// ────────────────────────────── EVT layout ──────────────────────────────

pub fn evt_write_pair(payload: &mut [u8], idx: u16, value: u32, utc_ms: u64) {
    debug_assert!(idx < EVT_PAIRS_PER_SECTOR);
    let off = idx as usize * EVT_PAIR_STRIDE;
    LittleEndian::write_u32(&mut payload[off..off + 4], value);
    LittleEndian::write_u64(&mut payload[off + 4..off + 12], utc_ms);
}

pub fn evt_pair(payload: &[u8], idx: u16) -> TsdEvtValue {
    debug_assert!(idx < EVT_PAIRS_PER_SECTOR);
    let off = idx as usize * EVT_PAIR_STRIDE;
    TsdEvtValue {
        value: LittleEndian::read_u32(&payload[off..off + 4]),
        utc_ms: LittleEndian::read_u64(&payload[off + 4..off + 12]),
    }
}

/// Read record `idx` out of a sector payload of the given type.
pub fn read_record(
    sector_type: SectorType,
    payload: &[u8],
    idx: u16,
    sample_rate_ms: u64,
) -> TsdEvtValue {
    match sector_type {
        SectorType::Tsd => TsdEvtValue {
            value: tsd_value(payload, idx),
            utc_ms: tsd_timestamp(tsd_first_utc(payload), idx, sample_rate_ms),
        },
        SectorType::Evt => evt_pair(payload, idx),
    }
}
