// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Spool state machine.
//!
//! One machine per upload source, driven by the periodic tick:
//!
//! ```text
//! Idle → Selecting → Writing → Verifying → Cleanup → Idle
//!                  ↘──────────── Error ←──────────↙
//! ```
//!
//! Idle leaves for Selecting when pool occupancy crosses the configured
//! pressure threshold and at least one sensor has spoolable sectors.
//! Selecting claims up to [`SELECT_BATCH`] sector ids; Writing moves up to
//! [`WRITE_BATCH`] of them per tick into the source's active spool file;
//! Verifying re-reads what was written and compares CRCs; Cleanup frees
//! the verified RAM sectors and unlinks fully-acked files. Three
//! consecutive failures in one state park the machine in Error until the
//! watchdog resets it. Every handler does a bounded amount of work so a
//! tick stays within its budget.
//!
//! Lock discipline: the engine holds the source lock for the whole tick;
//! sensor locks are taken per sensor and the pool lock per sector, and
//! neither is ever held across the disk I/O in Writing/Verifying.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::TimeAuthority;
use crate::config::SpoolConfig;
use crate::error::Result;
use crate::pool::SectorPool;
use crate::sector::{self, SectorId, SectorType, NULL_SECTOR_ID, SECTOR_PAYLOAD_BYTES};
use crate::sensor::SensorHandle;
use crate::spool::file::{
    self, payload_crc, spool_file_name, ActiveSpoolFile, SpoolRecord, SpoolRecordHeader,
    SPOOL_HEADER_BYTES, SPOOL_RECORD_BYTES,
};
use crate::spool::journal::Journal;
use crate::spool::{FileFormat, SourceDiskState, TrackedFile};
use crate::source::UPLOAD_SOURCE_COUNT;

/// Sector ids claimed per Selecting pass.
pub const SELECT_BATCH: usize = 10;
/// Sectors written per Writing tick.
pub const WRITE_BATCH: usize = 5;
/// Ticks in one state before the watchdog resets to Idle.
pub const WATCHDOG_TICKS: u32 = 100;
/// Consecutive failures before the machine parks in Error.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum SpoolPhase {
    #[default]
    Idle,
    Selecting,
    Writing,
    Verifying,
    Cleanup,
    Error,
}

impl SpoolPhase {
    pub fn name(self) -> &'static str {
        match self {
            SpoolPhase::Idle => "idle",
            SpoolPhase::Selecting => "selecting",
            SpoolPhase::Writing => "writing",
            SpoolPhase::Verifying => "verifying",
            SpoolPhase::Cleanup => "cleanup",
            SpoolPhase::Error => "error",
        }
    }
}

/// A RAM sector durably written and awaiting cleanup.
#[derive(Debug, Clone, Copy)]
pub struct SpooledSector {
    pub sector_id: SectorId,
    pub owner_sensor_id: u32,
    pub values: u32,
}

/// One appended batch awaiting verification.
#[derive(Debug)]
pub struct WrittenBatch {
    pub sensor_id: u32,
    pub sequence: u64,
    pub offset: u64,
    pub record_count: usize,
    pub sectors: Vec<SpooledSector>,
}

#[derive(Debug, Default)]
pub struct SpoolMachine {
    pub phase: SpoolPhase,
    pub selected: VecDeque<SectorId>,
    pub written: Vec<WrittenBatch>,
    pub verified: Vec<SpooledSector>,
    pub cycles_in_state: u32,
    pub consecutive_errors: u32,
}

/// Everything a tick needs besides the source state itself.
pub struct SpoolContext<'a> {
    pub pool: &'a SectorPool,
    pub clock: &'a TimeAuthority,
    /// Active sensors registered under this upload source.
    pub sensors: &'a [Arc<SensorHandle>],
    pub cfg: &'a SpoolConfig,
    pub journal: &'a Mutex<Journal>,
}

impl SpoolContext<'_> {
    fn handle(&self, sensor_id: u32) -> Option<&Arc<SensorHandle>> {
        self.sensors.iter().find(|h| h.config.id == sensor_id)
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_utc_ms().unwrap_or(0)
    }
}

/// Advance the machine one tick.
pub fn tick_source(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) {
    let phase = state.machine.phase;

    // Watchdog: a state that spins without transitioning gets reset so the
    // machine cannot wedge behind a persistently failing disk.
    if phase != SpoolPhase::Idle {
        state.machine.cycles_in_state += 1;
        if state.machine.cycles_in_state > WATCHDOG_TICKS {
            warn!(source = %state.source, state = phase.name(), "Spooler stalled, resetting to Idle");
            state.stats.spooler_stalls += 1;
            abandon_in_flight(state, ctx);
            transition(state, SpoolPhase::Idle);
            return;
        }
    }

    let next = match phase {
        SpoolPhase::Idle => idle(state, ctx),
        SpoolPhase::Selecting => selecting(state, ctx),
        SpoolPhase::Writing => writing(state, ctx),
        SpoolPhase::Verifying => verifying(state, ctx),
        SpoolPhase::Cleanup => cleanup(state, ctx),
        // Error is terminal until the watchdog fires.
        SpoolPhase::Error => SpoolPhase::Error,
    };
    if next != phase {
        transition(state, next);
    }
}

fn transition(state: &mut SourceDiskState, next: SpoolPhase) {
    debug!(source = %state.source, from = state.machine.phase.name(), to = next.name(),
        "Spooler transition");
    state.machine.phase = next;
    state.machine.cycles_in_state = 0;
}

/// Release claims and drop queued work after a watchdog reset.
fn abandon_in_flight(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) {
    for id in state.machine.selected.drain(..) {
        let _ = ctx.pool.set_spool_pending(id, false);
    }
    for batch in state.machine.written.drain(..) {
        for s in batch.sectors {
            let _ = ctx.pool.set_spool_pending(s.sector_id, false);
        }
    }
    // Verified sectors are durable on disk; finishing their cleanup is
    // safe and keeps the chain/file accounting consistent.
    let verified = std::mem::take(&mut state.machine.verified);
    release_verified(state, ctx, verified);
    state.machine.consecutive_errors = 0;
}

// ────────────────────────────── Idle ─────────────────────────────────────

fn idle(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) -> SpoolPhase {
    // Housekeeping that must not wait for pool pressure.
    unlink_fully_acked(state);
    if ctx.cfg.cleanup_orphaned_files {
        unlink_orphaned(state, ctx);
    }

    let usage = ctx.pool.usage();
    if usage.used_pct() < ctx.cfg.pressure_pct {
        return SpoolPhase::Idle;
    }
    if ctx.sensors.iter().any(|h| has_spoolable(h, ctx.pool)) {
        info!(source = %state.source, used_pct = usage.used_pct(), "Pool pressure, spool cycle starting");
        SpoolPhase::Selecting
    } else {
        SpoolPhase::Idle
    }
}

fn has_spoolable(handle: &SensorHandle, pool: &SectorPool) -> bool {
    let st = handle.state.lock();
    if !st.active || st.quarantined || st.ram_read_offset != 0 {
        return false;
    }
    if st.pending.iter().any(|p| p.ram_pending() > 0) {
        return false;
    }
    if st.ram_start == NULL_SECTOR_ID || st.ram_start == st.ram_end {
        return false;
    }
    match pool.entry(st.ram_start) {
        Ok(e) => e.in_use && !e.spooled_to_disk && !e.spool_pending && !e.pending_ack,
        Err(_) => false,
    }
}

// ─────────────────────────── Selecting ───────────────────────────────────

/// Claim up to [`SELECT_BATCH`] full, unspooled, unpended sectors.
///
/// Only the contiguous prefix of a chain is taken, and only from sensors
/// with no pending RAM records, so everything on disk stays strictly
/// older than everything left in RAM — the delivery order disk-then-RAM
/// holds without timestamp comparisons.
fn selecting(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) -> SpoolPhase {
    let mut room = SELECT_BATCH - state.machine.selected.len();
    for handle in ctx.sensors {
        if room == 0 {
            break;
        }
        let taken = select_from_sensor(state, ctx, handle, room);
        room -= taken;
    }
    if state.machine.selected.is_empty() {
        debug!(source = %state.source, "Nothing spoolable");
        return SpoolPhase::Idle;
    }
    SpoolPhase::Writing
}

fn select_from_sensor(
    state: &mut SourceDiskState,
    ctx: &SpoolContext<'_>,
    handle: &SensorHandle,
    room: usize,
) -> usize {
    let st = handle.state.lock();
    if !st.active || st.quarantined || st.ram_read_offset != 0 {
        return 0;
    }
    if st.pending.iter().any(|p| p.ram_pending() > 0) {
        return 0;
    }
    let mut cur = st.ram_start;
    let mut taken = 0;
    while cur != NULL_SECTOR_ID && cur != st.ram_end && taken < room {
        let Ok(entry) = ctx.pool.entry(cur) else { break };
        if !entry.in_use || entry.spooled_to_disk || entry.spool_pending || entry.pending_ack {
            break;
        }
        if ctx.pool.set_spool_pending(cur, true).is_err() {
            break;
        }
        state.machine.selected.push_back(cur);
        taken += 1;
        cur = entry.next;
    }
    taken
}

// ──────────────────────────── Writing ────────────────────────────────────

fn writing(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) -> SpoolPhase {
    let mut batch: Vec<SectorId> = Vec::with_capacity(WRITE_BATCH);
    while batch.len() < WRITE_BATCH {
        match state.machine.selected.pop_front() {
            Some(id) => batch.push(id),
            None => break,
        }
    }
    if batch.is_empty() {
        return SpoolPhase::Verifying;
    }

    // Snapshot payloads under the pool lock, grouped by owner in order.
    let mut groups: Vec<(u32, Vec<(SpooledSector, SpoolRecord)>)> = Vec::new();
    for id in batch {
        let (entry, payload) = match (ctx.pool.entry(id), ctx.pool.payload(id)) {
            (Ok(e), Ok(p)) => (e, p),
            _ => {
                let _ = ctx.pool.set_spool_pending(id, false);
                continue;
            }
        };
        if !entry.in_use || !entry.spool_pending {
            // Owner went away between Selecting and now.
            let _ = ctx.pool.set_spool_pending(id, false);
            continue;
        }
        let Some(handle) = ctx.handle(entry.owner_sensor_id) else {
            let _ = ctx.pool.set_spool_pending(id, false);
            continue;
        };
        let rate = handle.config.kind.sample_rate_ms();
        let values = entry.sector_type.capacity();
        let (first_utc, last_utc) = match entry.sector_type {
            SectorType::Tsd => {
                let first = sector::tsd_first_utc(&payload);
                (first, first + (values as u64 - 1) * rate)
            }
            SectorType::Evt => (
                sector::evt_pair(&payload, 0).utc_ms,
                sector::evt_pair(&payload, values - 1).utc_ms,
            ),
        };
        let record = SpoolRecord {
            header: SpoolRecordHeader {
                sector_type: entry.sector_type,
                utc_known: ctx.clock.utc_available(),
                owner_sensor_id: entry.owner_sensor_id,
                record_count: values,
                first_utc_ms: first_utc,
                last_utc_ms: last_utc,
                data_size: SECTOR_PAYLOAD_BYTES as u16,
                original_sector_id: id as u32,
                crc32: payload_crc(&payload),
            },
            payload,
        };
        let spooled = SpooledSector {
            sector_id: id,
            owner_sensor_id: entry.owner_sensor_id,
            values: values as u32,
        };
        match groups.last_mut() {
            Some((owner, recs)) if *owner == entry.owner_sensor_id => recs.push((spooled, record)),
            _ => groups.push((entry.owner_sensor_id, vec![(spooled, record)])),
        }
    }

    for (owner, recs) in groups {
        match write_group(state, ctx, owner, &recs) {
            Ok(Some(written)) => state.machine.written.push(written),
            Ok(None) => {
                // No file capacity right now; give the claims back.
                for (s, _) in &recs {
                    let _ = ctx.pool.set_spool_pending(s.sector_id, false);
                }
            }
            Err(e) => {
                error!(source = %state.source, sensor = owner, error = %e, "Spool write failed");
                for (s, _) in &recs {
                    let _ = ctx.pool.set_spool_pending(s.sector_id, false);
                }
                state.machine.consecutive_errors += 1;
                if state.machine.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return SpoolPhase::Error;
                }
                return SpoolPhase::Writing;
            }
        }
    }
    state.machine.consecutive_errors = 0;
    SpoolPhase::Verifying
}

/// Append one owner's records to the source's active file, creating or
/// rotating it as needed. `Ok(None)` means the tracked-file table is full
/// and nothing was written.
fn write_group(
    state: &mut SourceDiskState,
    ctx: &SpoolContext<'_>,
    owner: u32,
    recs: &[(SpooledSector, SpoolRecord)],
) -> Result<Option<WrittenBatch>> {
    if !ensure_active_file(state, ctx, owner)? {
        return Ok(None);
    }
    let dir_name = state.source.dir_name();
    let Some(active) = state.active.as_mut() else {
        return Ok(None);
    };
    let records: Vec<SpoolRecord> = recs.iter().map(|(_, r)| r.clone()).collect();
    let offset = active.append_batch(&records)?;
    if !active.is_renamed() {
        active.commit_rename()?;
        ctx.journal
            .lock()
            .commit(dir_name, &spool_file_name(active.sensor_id, active.sequence))?;
    }
    let sequence = active.sequence;
    let size_bytes = active.bytes_written;

    if let Some(tracked) = state.file_mut(owner, sequence) {
        tracked.readable = true;
        tracked.size_bytes = size_bytes;
        tracked.sector_records += records.len() as u32;
        tracked.value_total += records.iter().map(|r| r.header.record_count as u32).sum::<u32>();
        tracked.record_counts.extend(records.iter().map(|r| r.header.record_count));
        tracked.sector_type = records[0].header.sector_type;
        if records.iter().any(|r| !r.header.utc_known) {
            tracked.needs_utc_backfill = true;
        }
    }
    Ok(Some(WrittenBatch {
        sensor_id: owner,
        sequence,
        offset,
        record_count: records.len(),
        sectors: recs.iter().map(|(s, _)| *s).collect(),
    }))
}

/// Make sure the active file belongs to `owner` and has room. Returns
/// `false` when the tracked table is full and cannot be shed.
fn ensure_active_file(
    state: &mut SourceDiskState,
    ctx: &SpoolContext<'_>,
    owner: u32,
) -> Result<bool> {
    let rotate = match &state.active {
        Some(a) => a.sensor_id != owner || a.bytes_written >= ctx.cfg.file_rotation_bytes,
        None => true,
    };
    if !rotate {
        return Ok(true);
    }
    finalize_active_file(state, ctx)?;
    unlink_fully_acked(state);
    enforce_space_budget(state, ctx);
    if state.tracked.len() >= ctx.cfg.max_tracked_files_per_source {
        warn!(source = %state.source, "Tracked-file table full, spool write deferred");
        return Ok(false);
    }

    let sequence = state.next_sequence;
    let filename = spool_file_name(owner, sequence);
    ctx.journal.lock().begin(state.source.dir_name(), &filename)?;
    let active = ActiveSpoolFile::create(&state.dir, owner, sequence)?;
    state.next_sequence += 1;
    state.stats.files_created += 1;
    state.track(TrackedFile {
        filename,
        sequence,
        sensor_id: owner,
        format: FileFormat::Spool,
        size_bytes: 0,
        created_ms: ctx.now_ms(),
        active: true,
        readable: false,
        validated: false,
        sector_records: 0,
        value_total: 0,
        record_counts: Vec::new(),
        sector_type: SectorType::Tsd,
        delivered: [0; UPLOAD_SOURCE_COUNT],
        acked: [0; UPLOAD_SOURCE_COUNT],
        read_by: [false; UPLOAD_SOURCE_COUNT],
        released: 0,
        needs_utc_backfill: false,
    });
    state.active = Some(active);
    Ok(true)
}

/// Close the active file. An empty never-renamed file is deleted outright.
pub fn finalize_active_file(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) -> Result<()> {
    let Some(mut active) = state.active.take() else {
        return Ok(());
    };
    let owner = active.sensor_id;
    let sequence = active.sequence;
    let filename = spool_file_name(owner, sequence);
    if active.record_total == 0 && !active.is_renamed() {
        std::fs::remove_file(active.path())?;
        ctx.journal.lock().resolve(state.source.dir_name(), &filename)?;
        state.tracked.retain(|f| !(f.sensor_id == owner && f.sequence == sequence));
        return Ok(());
    }
    if !active.is_renamed() {
        active.commit_rename()?;
        ctx.journal.lock().commit(state.source.dir_name(), &filename)?;
    }
    if let Some(tracked) = state.file_mut(owner, sequence) {
        tracked.active = false;
        tracked.readable = true;
        tracked.size_bytes = active.bytes_written;
    }
    Ok(())
}

// ─────────────────────────── Verifying ───────────────────────────────────

/// Re-read a batch region and check every record header + payload CRC.
fn verify_region(path: &Path, offset: u64, record_count: usize) -> Result<bool> {
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; record_count * SPOOL_RECORD_BYTES];
    f.read_exact(&mut buf)?;
    for chunk in buf.chunks_exact(SPOOL_RECORD_BYTES) {
        let mut head = [0u8; SPOOL_HEADER_BYTES];
        head.copy_from_slice(&chunk[..SPOOL_HEADER_BYTES]);
        let header = match SpoolRecordHeader::decode(&head) {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };
        if header.crc32 != payload_crc(&chunk[SPOOL_HEADER_BYTES..]) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn verifying(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) -> SpoolPhase {
    let batches = std::mem::take(&mut state.machine.written);
    let mut failed = false;
    for batch in batches {
        let path = state.dir.join(spool_file_name(batch.sensor_id, batch.sequence));
        let ok = verify_region(&path, batch.offset, batch.record_count).unwrap_or(false);
        if ok {
            for s in &batch.sectors {
                let _ = ctx.pool.set_spooled(s.sector_id, true);
            }
            state.stats.sectors_spooled += batch.sectors.len() as u64;
            if let Some(tracked) = state.file_mut(batch.sensor_id, batch.sequence) {
                tracked.validated = true;
            }
            state.machine.verified.extend(batch.sectors);
        } else {
            failed = true;
            quarantine_file(state, ctx, batch);
        }
    }
    if failed {
        state.machine.consecutive_errors += 1;
        if state.machine.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            return SpoolPhase::Error;
        }
    } else {
        state.machine.consecutive_errors = 0;
    }
    SpoolPhase::Cleanup
}

/// Move a file that failed verification into quarantine. Records of
/// earlier batches in the same file that were already cleaned from RAM
/// are lost with it; the loss is counted.
fn quarantine_file(state: &mut SourceDiskState, ctx: &SpoolContext<'_>, batch: WrittenBatch) {
    error!(source = %state.source, sensor = batch.sensor_id, sequence = batch.sequence,
        "Spool verification failed, quarantining file");
    // This batch's sectors stay in RAM; release the claims.
    for s in &batch.sectors {
        let _ = ctx.pool.set_spool_pending(s.sector_id, false);
    }
    if state
        .active
        .as_ref()
        .is_some_and(|a| a.sensor_id == batch.sensor_id && a.sequence == batch.sequence)
    {
        state.active = None;
    }
    let Some(pos) = state
        .tracked
        .iter()
        .position(|f| f.sensor_id == batch.sensor_id && f.sequence == batch.sequence)
    else {
        return;
    };
    let tracked = state.tracked.remove(pos);
    // Earlier batches in this file were already counted as disk records.
    let batch_values: u32 = batch.sectors.iter().map(|s| s.values).sum();
    let lost = tracked.value_total.saturating_sub(tracked.released + batch_values);
    if lost > 0 {
        if let Some(handle) = ctx.handle(batch.sensor_id) {
            let mut st = handle.state.lock();
            st.total_disk_records = st.total_disk_records.saturating_sub(lost as u64);
        }
        state.stats.records_lost += lost as u64;
    }
    let path = state.dir.join(&tracked.filename);
    match file::quarantine(&path) {
        Ok(_) => state.stats.files_quarantined += 1,
        Err(e) => error!(source = %state.source, error = %e, "Quarantine move failed"),
    }
}

// ──────────────────────────── Cleanup ────────────────────────────────────

fn cleanup(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) -> SpoolPhase {
    let verified = std::mem::take(&mut state.machine.verified);
    release_verified(state, ctx, verified);
    unlink_fully_acked(state);
    enforce_space_budget(state, ctx);

    let usage = ctx.pool.usage();
    if usage.used_pct() >= ctx.cfg.pressure_pct
        && (!state.machine.selected.is_empty()
            || ctx.sensors.iter().any(|h| has_spoolable(h, ctx.pool)))
    {
        SpoolPhase::Selecting
    } else {
        // Going quiet: give back any claims the cycle did not consume so
        // readers and the discard path can reach those sectors again.
        for id in state.machine.selected.drain(..) {
            let _ = ctx.pool.set_spool_pending(id, false);
        }
        SpoolPhase::Idle
    }
}

/// Free verified sectors from their chains and shift the records into the
/// disk totals. Sectors were claimed as a contiguous chain prefix, so each
/// one is expected at its sensor's head.
fn release_verified(
    state: &mut SourceDiskState,
    ctx: &SpoolContext<'_>,
    verified: Vec<SpooledSector>,
) {
    for s in verified {
        let Some(handle) = ctx.handle(s.owner_sensor_id) else {
            // Sensor deactivated mid-flight; its chain was already drained.
            let _ = ctx.pool.set_spool_pending(s.sector_id, false);
            continue;
        };
        let mut st = handle.state.lock();
        if st.ram_start != s.sector_id {
            warn!(source = %state.source, sensor = s.owner_sensor_id, sector = s.sector_id as u32,
                "Spooled sector is not at chain head, leaving in RAM");
            continue;
        }
        let next = ctx.pool.next(s.sector_id).unwrap_or(NULL_SECTOR_ID);
        st.ram_start = next;
        st.ram_read_offset = 0;
        if st.ram_end == s.sector_id {
            st.ram_end = next;
        }
        st.total_records = st.total_records.saturating_sub(s.values as u64);
        st.total_disk_records += s.values as u64;
        for cursor in st.pending.iter_mut() {
            if cursor.start_sector == s.sector_id {
                cursor.start_sector = next;
                cursor.start_offset = 0;
            }
        }
        drop(st);
        if let Err(e) = ctx.pool.free(s.sector_id) {
            error!(source = %state.source, sector = s.sector_id as u32, error = %e,
                "Freeing spooled sector failed");
        }
    }
}

/// Unlink files every reading lane has fully acked.
pub fn unlink_fully_acked(state: &mut SourceDiskState) {
    let targets: Vec<(u32, u64)> = state
        .tracked
        .iter()
        .filter(|f| !f.active && f.fully_acked())
        .map(|f| (f.sensor_id, f.sequence))
        .collect();
    for (sensor_id, sequence) in targets {
        if let Err(e) = state.untrack_and_unlink(sensor_id, sequence) {
            warn!(source = %state.source, sensor = sensor_id, sequence, error = %e,
                "Unlinking acked spool file failed");
        }
    }
}

/// Opt-in: drop files of sensors no longer active once their records have
/// been released by some lane.
fn unlink_orphaned(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) {
    let targets: Vec<(u32, u64)> = state
        .tracked
        .iter()
        .filter(|f| {
            !f.active && f.released == f.value_total && f.value_total > 0
                && ctx.handle(f.sensor_id).is_none()
        })
        .map(|f| (f.sensor_id, f.sequence))
        .collect();
    for (sensor_id, sequence) in targets {
        if let Err(e) = state.untrack_and_unlink(sensor_id, sequence) {
            warn!(source = %state.source, sensor = sensor_id, sequence, error = %e,
                "Unlinking orphaned spool file failed");
        }
    }
}

/// Keep the source under its disk byte cap: fully-acked files go first;
/// failing that, the oldest non-active file is force-deleted and its
/// unacked records accounted as lost.
pub fn enforce_space_budget(state: &mut SourceDiskState, ctx: &SpoolContext<'_>) {
    while state.total_bytes() > ctx.cfg.per_source_byte_limit {
        unlink_fully_acked(state);
        if state.total_bytes() <= ctx.cfg.per_source_byte_limit {
            return;
        }
        let Some(victim) = state
            .tracked
            .iter()
            .filter(|f| !f.active)
            .min_by_key(|f| f.sequence)
            .map(|f| (f.sensor_id, f.sequence))
        else {
            return;
        };
        force_delete(state, ctx, victim.0, victim.1);
    }
}

fn force_delete(state: &mut SourceDiskState, ctx: &SpoolContext<'_>, sensor_id: u32, sequence: u64) {
    // Outstanding deliveries die with the file; pull them out of the
    // pending counts so the cursors stay consistent.
    if let Some(tracked) = state.file_mut(sensor_id, sequence) {
        let resident = tracked.value_total - tracked.released;
        let outstanding: Vec<(usize, u32)> = (0..UPLOAD_SOURCE_COUNT)
            .filter_map(|idx| {
                let out = tracked.delivered[idx] - tracked.acked[idx];
                (out > 0).then_some((idx, out))
            })
            .collect();
        if let Some(handle) = ctx.handle(sensor_id) {
            let mut st = handle.state.lock();
            st.total_disk_records = st.total_disk_records.saturating_sub(resident as u64);
            for (idx, out) in outstanding {
                st.pending[idx].count = st.pending[idx].count.saturating_sub(out);
                st.pending[idx].disk_pending = st.pending[idx].disk_pending.saturating_sub(out);
            }
        }
    }
    match state.untrack_and_unlink(sensor_id, sequence) {
        Ok(lost) => {
            if lost > 0 {
                warn!(source = %state.source, sensor = sensor_id, sequence, lost,
                    "Space budget exceeded, unacked spool records destroyed");
                state.stats.records_lost += lost;
            }
        }
        Err(e) => {
            error!(source = %state.source, sensor = sensor_id, sequence, error = %e,
                "Force delete failed");
        }
    }
}

// ───────────────────────── UTC backfill ──────────────────────────────────

/// Rewrite record headers stamped before UTC was known, applying the
/// external-sync delta. Driven from the tick once the clock is available.
pub fn backfill_utc(state: &mut SourceDiskState, clock: &TimeAuthority) {
    if !clock.utc_available() {
        return;
    }
    let Some(delta) = clock.backfill_delta_ms() else {
        return;
    };
    let targets: Vec<(u32, u64, String)> = state
        .tracked
        .iter()
        .filter(|f| f.needs_utc_backfill && f.readable && f.format == FileFormat::Spool)
        .map(|f| (f.sensor_id, f.sequence, f.filename.clone()))
        .collect();
    for (sensor_id, sequence, filename) in targets {
        let path = state.dir.join(&filename);
        match rewrite_unknown_utc(&path, delta) {
            Ok(n) => {
                state.stats.backfilled_records += n;
                if let Some(tracked) = state.file_mut(sensor_id, sequence) {
                    tracked.needs_utc_backfill = false;
                }
                if n > 0 {
                    info!(file = %filename, records = n, "UTC backfill applied");
                }
            }
            Err(e) => {
                warn!(file = %filename, error = %e, "UTC backfill failed");
            }
        }
    }
}

fn rewrite_unknown_utc(path: &Path, delta_ms: i64) -> Result<u64> {
    let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let len = f.metadata()?.len();
    let records = len / SPOOL_RECORD_BYTES as u64;
    let mut rewritten = 0u64;
    for idx in 0..records {
        let offset = idx * SPOOL_RECORD_BYTES as u64;
        f.seek(SeekFrom::Start(offset))?;
        let mut head = [0u8; SPOOL_HEADER_BYTES];
        f.read_exact(&mut head)?;
        let Ok(mut header) = SpoolRecordHeader::decode(&head) else { continue };
        if header.utc_known {
            continue;
        }
        header.first_utc_ms = (header.first_utc_ms as i64 + delta_ms) as u64;
        header.last_utc_ms = (header.last_utc_ms as i64 + delta_ms) as u64;
        header.utc_known = true;
        f.seek(SeekFrom::Start(offset))?;
        std::io::Write::write_all(&mut f, &header.encode())?;
        rewritten += 1;
    }
    if rewritten > 0 {
        f.sync_all()?;
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeSource;
    use crate::source::UploadSource;
    use crate::spool::file::scan_spool_file;

    fn fixture(dir: &Path) -> (SourceDiskState, SpoolConfig, Mutex<Journal>) {
        let state = SourceDiskState::new(UploadSource::Gateway, dir).expect("state");
        let cfg = SpoolConfig {
            base_path: dir.to_path_buf(),
            per_source_byte_limit: 1024 * 1024,
            file_rotation_bytes: 64 * 1024,
            pressure_pct: 80,
            max_tracked_files_per_source: 10,
            emergency_deadline_ms: 60_000,
            cleanup_orphaned_files: false,
        };
        let journal = Mutex::new(Journal::open(dir).expect("journal"));
        (state, cfg, journal)
    }

    fn record_with(utc_known: bool, first_utc: u64) -> SpoolRecord {
        let mut payload = [0u8; SECTOR_PAYLOAD_BYTES];
        sector::tsd_stamp_first_utc(&mut payload, first_utc);
        SpoolRecord {
            header: SpoolRecordHeader {
                sector_type: SectorType::Tsd,
                utc_known,
                owner_sensor_id: 1,
                record_count: 6,
                first_utc_ms: first_utc,
                last_utc_ms: first_utc + 5_000,
                data_size: SECTOR_PAYLOAD_BYTES as u16,
                original_sector_id: 0,
                crc32: payload_crc(&payload),
            },
            payload,
        }
    }

    #[test]
    fn watchdog_resets_a_wedged_machine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut state, cfg, journal) = fixture(dir.path());
        let pool = SectorPool::new(4);
        let clock = TimeAuthority::new(TimeSource::System);
        let ctx = SpoolContext { pool: &pool, clock: &clock, sensors: &[], cfg: &cfg, journal: &journal };

        state.machine.phase = SpoolPhase::Error;
        for _ in 0..WATCHDOG_TICKS {
            tick_source(&mut state, &ctx);
            assert_eq!(state.machine.phase, SpoolPhase::Error);
        }
        tick_source(&mut state, &ctx);
        assert_eq!(state.machine.phase, SpoolPhase::Idle);
        assert_eq!(state.stats.spooler_stalls, 1);
    }

    #[test]
    fn verify_region_catches_a_flipped_payload_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSpoolFile::create(dir.path(), 1, 0).expect("create");
        let offset = active.append_batch(&[record_with(true, 1_000)]).expect("append");
        active.commit_rename().expect("rename");
        let path = active.final_path();
        assert!(verify_region(&path, offset, 1).expect("verify"));

        let mut raw = std::fs::read(&path).expect("read");
        let len = raw.len();
        raw[len - 1] ^= 0xFF;
        std::fs::write(&path, &raw).expect("write");
        assert!(!verify_region(&path, offset, 1).expect("verify corrupt"));
    }

    #[test]
    fn backfill_rewrites_pre_sync_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut state, _cfg, _journal) = fixture(dir.path());

        let mut active = ActiveSpoolFile::create(&state.dir, 1, 0).expect("create");
        active
            .append_batch(&[record_with(false, 1_000), record_with(true, 90_000)])
            .expect("append");
        active.commit_rename().expect("rename");
        state.track(TrackedFile {
            filename: spool_file_name(1, 0),
            sequence: 0,
            sensor_id: 1,
            format: FileFormat::Spool,
            size_bytes: active.bytes_written,
            created_ms: 0,
            active: false,
            readable: true,
            validated: true,
            sector_records: 2,
            value_total: 12,
            record_counts: vec![6, 6],
            sector_type: SectorType::Tsd,
            delivered: [0; UPLOAD_SOURCE_COUNT],
            acked: [0; UPLOAD_SOURCE_COUNT],
            read_by: [false; UPLOAD_SOURCE_COUNT],
            released: 0,
            needs_utc_backfill: true,
        });

        // Device-local clock read 2 000 when the sync said 50 000: +48 000.
        let clock = TimeAuthority::new(TimeSource::Manual);
        clock.observe_tick(2_000);
        clock.set_reference_utc_ms(50_000);
        backfill_utc(&mut state, &clock);

        assert_eq!(state.stats.backfilled_records, 1);
        assert!(!state.tracked[0].needs_utc_backfill);
        let scanned = scan_spool_file(&state.dir.join(spool_file_name(1, 0))).expect("scan");
        assert!(scanned.records[0].header.utc_known);
        assert_eq!(scanned.records[0].header.first_utc_ms, 49_000);
        // Records stamped after the sync are untouched.
        assert_eq!(scanned.records[1].header.first_utc_ms, 90_000);
    }
}
