// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! RAM read path and pending-cursor maintenance.
//!
//! Every upload source keeps its own cursor into a sensor's chain. A read
//! delivers the records after the cursor's pending window and grows the
//! window; an ack (`erase`) moves the window's start forward, freeing
//! sectors nobody references anymore; a nack (`revert`) collapses the
//! window back to its start so the same records replay.
//!
//! Sectors claimed by an in-flight spool write are skipped — their
//! records arrive from disk once the spooler finishes, never twice.

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::pool::SectorPool;
use crate::sector::{self, TsdEvtValue, NULL_SECTOR_ID};
use crate::sensor::{SensorHandle, SensorState};
use crate::source::UploadSource;

/// Deliver up to `max` RAM records for `(source, sensor)` into `out`,
/// marking the delivered region pending. Returns the count delivered.
pub fn read_ram(
    pool: &SectorPool,
    handle: &SensorHandle,
    source: UploadSource,
    out: &mut Vec<TsdEvtValue>,
    max: usize,
) -> Result<u32> {
    let sector_type = handle.config.kind.sector_type();
    let rate = handle.config.kind.sample_rate_ms();
    let mut state = handle.state.lock();
    if !state.active {
        return Err(StoreError::InactiveSensor { id: handle.config.id });
    }

    let idx = source.index();
    if state.pending[idx].start_sector == NULL_SECTOR_ID {
        // First read since the last full erase: anchor the window at the
        // oldest retained record.
        state.pending[idx].start_sector = state.ram_start;
        state.pending[idx].start_offset = state.ram_read_offset;
    }
    let (mut sec, start_offset) = (
        state.pending[idx].start_sector,
        state.pending[idx].start_offset,
    );
    if sec == NULL_SECTOR_ID {
        return Ok(0);
    }
    let mut record_idx = sector_type.records_at_offset(start_offset);
    let mut skip = state.pending[idx].ram_pending();
    let mut delivered: u32 = 0;

    let mut guard: usize = 0;
    while sec != NULL_SECTOR_ID && (delivered as usize) < max {
        guard += 1;
        if guard > pool.capacity() {
            return Err(StoreError::CorruptChain {
                id: handle.config.id,
                reason: "cycle detected during read walk".into(),
            });
        }
        let entry = pool.entry(sec)?;
        if entry.spool_pending || entry.spooled_to_disk {
            break;
        }
        let total = state.records_in_sector(sec, sector_type)
            + state.first_record_in_sector(sec, sector_type);
        if record_idx < state.first_record_in_sector(sec, sector_type) {
            record_idx = state.first_record_in_sector(sec, sector_type);
        }
        // Fast-skip the part of the pending window inside this sector.
        let in_sector = (total - record_idx) as u32;
        if skip >= in_sector {
            skip -= in_sector;
            sec = entry.next;
            record_idx = 0;
            continue;
        }
        record_idx += skip as u16;
        skip = 0;

        let payload = pool.payload(sec)?;
        let mut took = false;
        while record_idx < total && (delivered as usize) < max {
            out.push(sector::read_record(sector_type, &payload, record_idx, rate));
            record_idx += 1;
            delivered += 1;
            took = true;
        }
        if took {
            pool.set_pending_ack(sec, true)?;
        }
        if record_idx < total {
            break;
        }
        sec = entry.next;
        record_idx = 0;
    }

    state.pending[idx].count += delivered;
    debug!(sensor = handle.config.id, source = %source, delivered, "RAM records read");
    Ok(delivered)
}

/// Collapse the source's RAM pending window back to its start. The disk
/// share of the window is handled by the disk reader. Idempotent.
pub fn revert_ram(pool: &SectorPool, handle: &SensorHandle, source: UploadSource) -> Result<()> {
    let mut state = handle.state.lock();
    if !state.active {
        return Err(StoreError::InactiveSensor { id: handle.config.id });
    }
    let idx = source.index();
    let ram = state.pending[idx].ram_pending();
    state.pending[idx].count -= ram;
    recompute_pending_flags(pool, &mut state, handle.config.kind.sector_type())?;
    Ok(())
}

/// Ack `take` RAM records for the source: advance the window start,
/// refresh pending flags, and free the chain prefix nobody references.
pub fn erase_ram(
    pool: &SectorPool,
    handle: &SensorHandle,
    state: &mut SensorState,
    source: UploadSource,
    take: u32,
) -> Result<()> {
    let sector_type = handle.config.kind.sector_type();
    let idx = source.index();

    // Advance the cursor start `take` records forward.
    let mut sec = state.pending[idx].start_sector;
    let mut record_idx = sector_type.records_at_offset(state.pending[idx].start_offset);
    let mut remaining = take;
    let mut guard: usize = 0;
    while remaining > 0 && sec != NULL_SECTOR_ID {
        guard += 1;
        if guard > pool.capacity() {
            return Err(StoreError::CorruptChain {
                id: handle.config.id,
                reason: "cycle detected during erase walk".into(),
            });
        }
        let entry = pool.entry(sec)?;
        let first = state.first_record_in_sector(sec, sector_type);
        let total = state.records_in_sector(sec, sector_type) + first;
        if record_idx < first {
            record_idx = first;
        }
        let in_sector = (total - record_idx) as u32;
        if remaining >= in_sector {
            remaining -= in_sector;
            sec = entry.next;
            record_idx = 0;
        } else {
            record_idx += remaining as u16;
            remaining = 0;
        }
    }
    state.pending[idx].start_sector = sec;
    state.pending[idx].start_offset = sector_type.byte_offset(record_idx);
    state.pending[idx].count -= take;
    state.total_records = state.total_records.saturating_sub(take as u64);

    recompute_pending_flags(pool, state, sector_type)?;
    free_acked_prefix(pool, state, source)?;
    Ok(())
}

/// Rebuild the per-sector pending flags from every source's window.
/// Called after reverts and erases, when windows shrink.
pub fn recompute_pending_flags(
    pool: &SectorPool,
    state: &mut SensorState,
    sector_type: crate::sector::SectorType,
) -> Result<()> {
    // Clear, then re-mark each live window.
    let mut sec = state.ram_start;
    let mut guard: usize = 0;
    while sec != NULL_SECTOR_ID {
        guard += 1;
        if guard > pool.capacity() {
            return Err(StoreError::CorruptChain {
                id: 0,
                reason: "cycle detected while clearing pending flags".into(),
            });
        }
        let entry = pool.entry(sec)?;
        if entry.pending_ack {
            pool.set_pending_ack(sec, false)?;
        }
        sec = entry.next;
    }
    for idx in 0..state.pending.len() {
        let cursor = state.pending[idx];
        let mut remaining = cursor.ram_pending();
        if remaining == 0 {
            continue;
        }
        let mut sec = cursor.start_sector;
        let mut record_idx = sector_type.records_at_offset(cursor.start_offset);
        let mut guard: usize = 0;
        while remaining > 0 && sec != NULL_SECTOR_ID {
            guard += 1;
            if guard > pool.capacity() {
                break;
            }
            let entry = pool.entry(sec)?;
            let first = state.first_record_in_sector(sec, sector_type);
            let total = state.records_in_sector(sec, sector_type) + first;
            if record_idx < first {
                record_idx = first;
            }
            let in_sector = (total.saturating_sub(record_idx)) as u32;
            if in_sector > 0 {
                pool.set_pending_ack(sec, true)?;
            }
            remaining = remaining.saturating_sub(in_sector);
            sec = entry.next;
            record_idx = 0;
        }
    }
    Ok(())
}

/// Free the chain prefix the erasing source has acked, stopping at its new
/// erase point, at any sector a pending window covers, and at anything
/// claimed by the spooler. The first lane to ack a region releases it;
/// cursors of lanes that never read it snap forward to the new head.
fn free_acked_prefix(
    pool: &SectorPool,
    state: &mut SensorState,
    erasing: UploadSource,
) -> Result<()> {
    let idx = erasing.index();
    let stop_sector = state.pending[idx].start_sector;
    let stop_offset = state.pending[idx].start_offset;

    let mut guard: usize = 0;
    loop {
        guard += 1;
        if guard > pool.capacity() {
            return Err(StoreError::CorruptChain {
                id: 0,
                reason: "cycle detected while freeing acked sectors".into(),
            });
        }
        let head = state.ram_start;
        if head == NULL_SECTOR_ID {
            break;
        }
        if head == stop_sector {
            // Partially acked head. The read offset moves up only when no
            // other window still begins before the erase point in this
            // sector — pending records are kept addressable for replay.
            let safe = state
                .pending
                .iter()
                .enumerate()
                .all(|(i, c)| {
                    i == idx || c.start_sector != head || c.start_offset >= stop_offset
                });
            if safe && stop_offset > state.ram_read_offset {
                state.ram_read_offset = stop_offset;
            }
            break;
        }
        let entry = pool.entry(head)?;
        if entry.pending_ack || entry.spool_pending || entry.spooled_to_disk {
            break;
        }
        let next = entry.next;
        for cursor in state.pending.iter_mut() {
            if cursor.start_sector == head {
                cursor.start_sector = next;
                cursor.start_offset = 0;
            }
        }
        if head == state.ram_end {
            // Fully acked tail: the chain empties out.
            state.ram_end = NULL_SECTOR_ID;
            state.ram_start = NULL_SECTOR_ID;
            state.ram_read_offset = 0;
            state.ram_write_offset = 0;
            for cursor in state.pending.iter_mut() {
                cursor.start_sector = NULL_SECTOR_ID;
                cursor.start_offset = 0;
            }
            pool.free(head)?;
            break;
        }
        state.ram_start = next;
        state.ram_read_offset = 0;
        pool.free(head)?;
    }
    Ok(())
}
