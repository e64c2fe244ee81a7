// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Append path.
//!
//! Appends land in the tail sector of the sensor's chain; a new sector is
//! allocated when the tail fills (TSD: 6 values, EVT: 2 pairs). Pool
//! exhaustion is handled by profile: the RAM-only profile discards the
//! sensor's own oldest non-pending sector and retries, the tiered
//! profile reports `OutOfMemory` so the engine can kick the spooler and
//! retry the append once.
//!
//! All work happens under the sensor lock with O(1) excursions into the
//! pool lock; no disk I/O on this path.

use tracing::debug;

use crate::clock::TimeAuthority;
use crate::error::{Result, StoreError};
use crate::pool::SectorPool;
use crate::sector::{self, SectorType, NULL_SECTOR_ID};
use crate::sensor::{SensorHandle, SensorState};

/// How an append should react to pool exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPolicy {
    /// Discard this sensor's oldest non-pending sector and retry.
    DiscardOldest,
    /// Fail with `OutOfMemory`; the caller kicks the spooler and retries.
    ReportFull,
}

/// Append one TSD value. `utc_wait_ms` bounds the external-clock gate.
pub fn append_tsd(
    pool: &SectorPool,
    clock: &TimeAuthority,
    handle: &SensorHandle,
    value: u32,
    utc_wait_ms: u64,
    shutting_down: bool,
    policy: FullPolicy,
) -> Result<()> {
    if handle.config.kind.sector_type() != SectorType::Tsd {
        return Err(StoreError::InvalidParameter(format!(
            "sensor {} is not configured for time-series data",
            handle.config.id
        )));
    }
    // Shutdown wins over the UTC gate: a write must not sit in the gate's
    // wait only to learn the engine is going down.
    if shutting_down {
        return Err(StoreError::ShuttingDown);
    }
    let utc_ms = clock.utc_or_wait(utc_wait_ms)?;
    append(pool, clock, handle, value, utc_ms, shutting_down, policy)
}

/// Append one EVT pair with its caller-supplied timestamp. Gated on UTC
/// like the TSD path even though the pair carries its own stamp.
pub fn append_evt(
    pool: &SectorPool,
    clock: &TimeAuthority,
    handle: &SensorHandle,
    value: u32,
    utc_ms: u64,
    utc_wait_ms: u64,
    shutting_down: bool,
    policy: FullPolicy,
) -> Result<()> {
    if handle.config.kind.sector_type() != SectorType::Evt {
        return Err(StoreError::InvalidParameter(format!(
            "sensor {} is not configured for event data",
            handle.config.id
        )));
    }
    if shutting_down {
        return Err(StoreError::ShuttingDown);
    }
    clock.utc_or_wait(utc_wait_ms)?;
    append(pool, clock, handle, value, utc_ms, shutting_down, policy)
}

fn append(
    pool: &SectorPool,
    clock: &TimeAuthority,
    handle: &SensorHandle,
    value: u32,
    utc_ms: u64,
    shutting_down: bool,
    policy: FullPolicy,
) -> Result<()> {
    let sector_type = handle.config.kind.sector_type();
    let capacity_offset = sector_type.byte_offset(sector_type.capacity());
    let mut state = handle.state.lock();

    if shutting_down {
        return Err(StoreError::ShuttingDown);
    }
    if !state.active {
        return Err(StoreError::InactiveSensor { id: handle.config.id });
    }
    if state.quarantined {
        return Err(StoreError::CorruptChain {
            id: handle.config.id,
            reason: "sensor is quarantined".into(),
        });
    }

    // A rollover invalidates the open tail's base timestamp. The tail is
    // re-stamped at the next append so post-rollover values compute
    // correct timestamps; the values already in it shift with the new
    // base. Records in closed sectors keep their original stamps.
    let generation = clock.rollover_generation();
    let tail_full = state.ram_end == NULL_SECTOR_ID || state.ram_write_offset >= capacity_offset;
    if !tail_full && sector_type == SectorType::Tsd && state.tail_clock_generation != generation {
        let idx = sector_type.records_at_offset(state.ram_write_offset);
        let rate = handle.config.kind.sample_rate_ms();
        let new_first = utc_ms.saturating_sub(idx as u64 * rate);
        pool.with_payload_mut(state.ram_end, |payload| {
            sector::tsd_stamp_first_utc(payload, new_first)
        })?;
        state.tail_clock_generation = generation;
    }

    if tail_full {
        let new = match pool.allocate(handle.config.id, sector_type, utc_ms) {
            Some(id) => id,
            None => match policy {
                FullPolicy::DiscardOldest => {
                    discard_oldest_non_pending(pool, handle.config.id, &mut state)?;
                    pool.allocate(handle.config.id, sector_type, utc_ms)
                        .ok_or(StoreError::OutOfMemory)?
                }
                FullPolicy::ReportFull => return Err(StoreError::OutOfMemory),
            },
        };
        if state.ram_end == NULL_SECTOR_ID {
            state.ram_start = new;
            state.ram_read_offset = 0;
        } else if let Err(e) = pool.link(state.ram_end, new) {
            let _ = pool.free(new);
            return Err(e);
        }
        state.ram_end = new;
        state.ram_write_offset = sector_type.byte_offset(0);
        state.tail_clock_generation = generation;
        if sector_type == SectorType::Tsd {
            pool.with_payload_mut(new, |payload| sector::tsd_stamp_first_utc(payload, utc_ms))?;
        }
    }

    let idx = sector_type.records_at_offset(state.ram_write_offset);
    match sector_type {
        SectorType::Tsd => {
            pool.with_payload_mut(state.ram_end, |payload| {
                sector::tsd_write_value(payload, idx, value)
            })?;
            state.ram_write_offset += 4;
        }
        SectorType::Evt => {
            pool.with_payload_mut(state.ram_end, |payload| {
                sector::evt_write_pair(payload, idx, value, utc_ms)
            })?;
            state.ram_write_offset += 12;
        }
    }
    state.total_records += 1;
    state.last_sample_time_ms = utc_ms;
    Ok(())
}

/// Drop this sensor's oldest sector that no upload source holds pending.
/// Never touches other sensors' chains. Fails with `AllPending` when every
/// sector is pending somewhere.
pub fn discard_oldest_non_pending(
    pool: &SectorPool,
    sensor_id: u32,
    state: &mut SensorState,
) -> Result<()> {
    let mut prev = NULL_SECTOR_ID;
    let mut cur = state.ram_start;
    let mut guard: usize = 0;
    while cur != NULL_SECTOR_ID {
        guard += 1;
        if guard > pool.capacity() {
            return Err(StoreError::CorruptChain {
                id: sensor_id,
                reason: "cycle detected during discard walk".into(),
            });
        }
        let entry = pool.entry(cur)?;
        if !entry.pending_ack {
            let records = state.records_in_sector(cur, entry.sector_type);
            let next = entry.next;
            if prev == NULL_SECTOR_ID {
                state.ram_start = next;
                state.ram_read_offset = 0;
            } else {
                pool.relink(prev, next)?;
            }
            if state.ram_end == cur {
                state.ram_end = prev;
                state.ram_write_offset = if prev == NULL_SECTOR_ID {
                    0
                } else {
                    entry.sector_type.byte_offset(entry.sector_type.capacity())
                };
            }
            // Cursors parked on the discarded sector move to its successor.
            for cursor in state.pending.iter_mut() {
                if cursor.start_sector == cur {
                    cursor.start_sector = next;
                    cursor.start_offset = 0;
                }
            }
            state.total_records = state.total_records.saturating_sub(records as u64);
            state.dropped_records += records as u64;
            pool.free(cur)?;
            debug!(sensor = sensor_id, sector = cur as u32, records, "Oldest sector discarded");
            return Ok(());
        }
        prev = cur;
        cur = entry.next;
    }
    Err(StoreError::AllPending { id: sensor_id })
}
