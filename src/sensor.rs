// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-sensor state.
//!
//! The engine is stateless over sensor identity: callers hold a
//! [`SensorHandle`] per `(upload_source, sensor_id)` and pass it on every
//! call. The engine itself keeps only a thin activate-time registry so the
//! spooler can walk a source's sensors. A sensor id is unique only within
//! its upload source.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::sector::{SectorId, SectorType, NULL_SECTOR_ID};
use crate::source::{UploadSource, UPLOAD_SOURCE_COUNT};

/// What a sensor produces. Fixed at configure time; a chain never mixes
/// sector types, so every non-tail sector is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Periodic samples at a fixed rate; timestamps computed, not stored.
    Tsd { sample_rate_ms: u64 },
    /// Irregular samples, each carrying its own timestamp.
    Evt,
}

impl DataKind {
    pub fn sector_type(self) -> SectorType {
        match self {
            DataKind::Tsd { .. } => SectorType::Tsd,
            DataKind::Evt => SectorType::Evt,
        }
    }

    /// Sample interval for TSD sensors; zero for EVT.
    pub fn sample_rate_ms(self) -> u64 {
        match self {
            DataKind::Tsd { sample_rate_ms } => sample_rate_ms,
            DataKind::Evt => 0,
        }
    }
}

/// Immutable sensor configuration supplied by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: u32,
    pub kind: DataKind,
}

/// One upload source's read position into a sensor's data.
///
/// `start_sector`/`start_offset` mark this source's ack high-water inside
/// RAM; `count` is the number of records currently pending (read but not
/// acked) across disk and RAM, `disk_pending` the disk share of it.
#[derive(Debug, Clone, Copy)]
pub struct PendingCursor {
    pub count: u32,
    pub start_sector: SectorId,
    pub start_offset: u16,
    pub disk_pending: u32,
    /// Disk records this source has acked since boot, used to resume the
    /// disk reader after a revert.
    pub disk_acked: u64,
}

impl Default for PendingCursor {
    fn default() -> Self {
        PendingCursor {
            count: 0,
            start_sector: NULL_SECTOR_ID,
            start_offset: 0,
            disk_pending: 0,
            disk_acked: 0,
        }
    }
}

impl PendingCursor {
    /// RAM records currently pending for this source.
    pub fn ram_pending(&self) -> u32 {
        self.count - self.disk_pending
    }
}

/// Mutable per-sensor engine state, guarded by the handle's lock.
#[derive(Debug)]
pub struct SensorState {
    /// Head of the RAM chain, or NULL when empty.
    pub ram_start: SectorId,
    /// Tail of the RAM chain (the sector being appended to), or NULL.
    pub ram_end: SectorId,
    /// Byte offset of the oldest retained record within `ram_start`.
    pub ram_read_offset: u16,
    /// Byte offset of the next append within `ram_end`.
    pub ram_write_offset: u16,
    pub pending: [PendingCursor; UPLOAD_SOURCE_COUNT],
    /// Records currently resident in RAM.
    pub total_records: u64,
    /// Records resident in validated spool files.
    pub total_disk_records: u64,
    pub last_sample_time_ms: u64,
    /// Rollover generation captured when the tail sector was stamped. A
    /// mismatch with the clock closes the tail before the next append.
    pub tail_clock_generation: u64,
    /// Set when a chain walk detected corruption; writes are rejected until
    /// operator action resets the sensor.
    pub quarantined: bool,
    pub active: bool,
    /// Records dropped (pool exhaustion, discard failures) since configure.
    pub dropped_records: u64,
}

impl SensorState {
    fn new() -> Self {
        SensorState {
            ram_start: NULL_SECTOR_ID,
            ram_end: NULL_SECTOR_ID,
            ram_read_offset: 0,
            ram_write_offset: 0,
            pending: [PendingCursor::default(); UPLOAD_SOURCE_COUNT],
            total_records: 0,
            total_disk_records: 0,
            last_sample_time_ms: 0,
            tail_clock_generation: 0,
            quarantined: false,
            active: false,
            dropped_records: 0,
        }
    }

    /// Zero everything back to the configure-time state.
    pub fn reset(&mut self) {
        *self = SensorState::new();
    }

    /// Records held by `sector` that have not been erased: the tail stops
    /// at the write offset, the head starts past the read offset.
    pub(crate) fn records_in_sector(&self, sector: SectorId, sector_type: SectorType) -> u16 {
        let total = if sector == self.ram_end {
            sector_type.records_at_offset(self.ram_write_offset)
        } else {
            sector_type.capacity()
        };
        if sector == self.ram_start && self.ram_read_offset != 0 {
            total.saturating_sub(sector_type.records_at_offset(self.ram_read_offset))
        } else {
            total
        }
    }

    /// Record index where the retained region of `sector` begins.
    pub(crate) fn first_record_in_sector(&self, sector: SectorId, sector_type: SectorType) -> u16 {
        if sector == self.ram_start {
            sector_type.records_at_offset(self.ram_read_offset)
        } else {
            0
        }
    }
}

/// Caller-held handle pairing a sensor's config with its engine state.
pub struct SensorHandle {
    pub source: UploadSource,
    pub config: SensorConfig,
    pub(crate) state: Mutex<SensorState>,
}

impl SensorHandle {
    pub(crate) fn new(source: UploadSource, config: SensorConfig) -> Self {
        SensorHandle { source, config, state: Mutex::new(SensorState::new()) }
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    /// Read-only snapshot for diagnostics.
    pub fn snapshot(&self) -> SensorSnapshot {
        let state = self.state.lock();
        SensorSnapshot {
            source: self.source,
            id: self.config.id,
            kind: self.config.kind,
            active: state.active,
            quarantined: state.quarantined,
            total_records: state.total_records,
            total_disk_records: state.total_disk_records,
            pending: state.pending.iter().map(|p| p.count).collect(),
            last_sample_time_ms: state.last_sample_time_ms,
            dropped_records: state.dropped_records,
        }
    }
}

/// Diagnostic view of one sensor (`get_sensor_state`).
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub source: UploadSource,
    pub id: u32,
    pub kind: DataKind,
    pub active: bool,
    pub quarantined: bool,
    pub total_records: u64,
    pub total_disk_records: u64,
    /// Pending count per upload source, indexed by `UploadSource::index`.
    pub pending: Vec<u32>,
    pub last_sample_time_ms: u64,
    pub dropped_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_resets_to_configure_shape() {
        let handle = SensorHandle::new(
            UploadSource::Gateway,
            SensorConfig { id: 3, kind: DataKind::Evt },
        );
        {
            let mut state = handle.state.lock();
            state.total_records = 10;
            state.active = true;
            state.pending[0].count = 4;
            state.reset();
        }
        let snap = handle.snapshot();
        assert!(!snap.active);
        assert_eq!(snap.total_records, 0);
        assert_eq!(snap.pending[0], 0);
    }

    #[test]
    fn data_kind_maps_to_sector_type() {
        assert_eq!(DataKind::Tsd { sample_rate_ms: 500 }.sector_type(), SectorType::Tsd);
        assert_eq!(DataKind::Evt.sector_type(), SectorType::Evt);
        assert_eq!(DataKind::Tsd { sample_rate_ms: 500 }.sample_rate_ms(), 500);
    }
}
