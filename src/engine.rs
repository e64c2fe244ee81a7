// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage engine facade: orchestrates the sector pool, per-sensor
//! buffers, the disk spool tier, and the time authority behind one public
//! API.
//!
//! The engine is stateless over sensor identity: callers keep an
//! [`Arc<SensorHandle>`] per `(upload_source, sensor_id)` and pass it on
//! every call. Internally only a thin activate-time registry exists so
//! the spooler can walk a source's sensors.
//!
//! Lock discipline, outermost to innermost: source → sensor → pool. No
//! sensor or pool lock is ever held across disk I/O; the spool machine
//! captures sector snapshots under lock and runs I/O lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::TimeAuthority;
use crate::config::{EngineConfig, SpoolConfig};
use crate::error::{Result, StoreError};
use crate::pool::{PoolUsage, SectorPool};
use crate::reader;
use crate::sector::{TsdEvtValue, NULL_SECTOR_ID};
use crate::sensor::{SensorConfig, SensorHandle, SensorSnapshot};
use crate::source::{UploadSource, ALL_SOURCES, UPLOAD_SOURCE_COUNT};
use crate::spool::machine::{self, SpoolContext, SpoolPhase};
use crate::spool::{disk_reader, emergency, journal::Journal, recovery, SourceDiskState, SourceStats};
use crate::writer::{self, FullPolicy};

/// Iteration cap for synchronously driven spool cycles (deactivate flush,
/// write-path pressure relief).
const FORCED_SPOOL_TICKS: usize = 1_000;

struct DiskTier {
    cfg: SpoolConfig,
    journal: Mutex<Journal>,
    sources: Vec<Mutex<SourceDiskState>>,
}

/// The tiered sensor-data storage engine.
pub struct Engine {
    config: EngineConfig,
    pool: SectorPool,
    clock: TimeAuthority,
    registry: Mutex<HashMap<(UploadSource, u32), Arc<SensorHandle>>>,
    disk: Option<DiskTier>,
    shutting_down: AtomicBool,
}

/// Point-in-time engine statistics (`get_stats`).
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pool_capacity: usize,
    pub pool_free: usize,
    pub pool_used_pct: u8,
    pub sensors: usize,
    pub utc_available: bool,
    pub sources: Vec<SourceStatsView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatsView {
    pub source: UploadSource,
    pub phase: SpoolPhase,
    pub tracked_files: usize,
    pub disk_bytes: u64,
    pub stats: SourceStats,
}

impl Engine {
    /// Build an engine from a validated configuration. Idempotent per
    /// process in the sense that each call owns its own pool.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = SectorPool::new(config.sector_count());
        let clock = TimeAuthority::new(config.time_source);
        let disk = match &config.spool {
            Some(spool_cfg) => {
                std::fs::create_dir_all(&spool_cfg.base_path)?;
                let journal = Mutex::new(Journal::open(&spool_cfg.base_path)?);
                let mut sources = Vec::with_capacity(UPLOAD_SOURCE_COUNT);
                for source in ALL_SOURCES {
                    sources.push(Mutex::new(SourceDiskState::new(source, &spool_cfg.base_path)?));
                }
                Some(DiskTier { cfg: spool_cfg.clone(), journal, sources })
            }
            None => None,
        };
        info!(
            sectors = pool.capacity(),
            tiered = disk.is_some(),
            time_source = ?config.time_source,
            "Storage engine initialised"
        );
        Ok(Engine { config, pool, clock, registry: Mutex::new(HashMap::new()), disk, shutting_down: AtomicBool::new(false) })
    }

    pub fn clock(&self) -> &TimeAuthority {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─────────────────────── sensor lifecycle ──────────────────────────

    /// Register a sensor under `source` with zeroed state. The returned
    /// handle is what every subsequent call takes.
    pub fn configure_sensor(
        &self,
        source: UploadSource,
        config: SensorConfig,
    ) -> Result<Arc<SensorHandle>> {
        let mut registry = self.registry.lock();
        if registry.contains_key(&(source, config.id)) {
            return Err(StoreError::InvalidParameter(format!(
                "sensor {}/{} already configured",
                source, config.id
            )));
        }
        let handle = Arc::new(SensorHandle::new(source, config));
        registry.insert((source, config.id), handle.clone());
        info!(source = %source, sensor = config.id, kind = ?config.kind, "Sensor configured");
        Ok(handle)
    }

    pub fn activate_sensor(&self, handle: &Arc<SensorHandle>) -> Result<()> {
        let registered = self
            .registry
            .lock()
            .get(&(handle.source, handle.config.id))
            .is_some_and(|h| Arc::ptr_eq(h, handle));
        if !registered {
            return Err(StoreError::InactiveSensor { id: handle.config.id });
        }
        handle.state.lock().active = true;
        Ok(())
    }

    /// Deactivate: best-effort flush of this sensor's RAM to disk on the
    /// tiered profile, then drain and reset the state block.
    pub fn deactivate_sensor(&self, handle: &Arc<SensorHandle>) -> Result<()> {
        if self.disk.is_some() {
            self.force_spool(handle.source);
        }
        // Free whatever is left in RAM.
        {
            let mut state = handle.state.lock();
            state.active = false;
            let mut cur = state.ram_start;
            let mut guard: usize = 0;
            while cur != NULL_SECTOR_ID && guard <= self.pool.capacity() {
                guard += 1;
                let next = self.pool.next(cur).unwrap_or(NULL_SECTOR_ID);
                if let Err(e) = self.pool.free(cur) {
                    warn!(sensor = handle.config.id, sector = cur as u32, error = %e,
                        "Freeing sector at deactivate failed");
                }
                cur = next;
            }
            state.reset();
        }
        self.registry.lock().remove(&(handle.source, handle.config.id));
        info!(source = %handle.source, sensor = handle.config.id, "Sensor deactivated");
        Ok(())
    }

    // ─────────────────────────── writes ────────────────────────────────

    /// Append one time-series value, stamped with the current UTC.
    pub fn write_tsd(
        &self,
        handle: &SensorHandle,
        value: u32,
        utc_wait_ms: u64,
    ) -> Result<()> {
        let policy = self.full_policy();
        let shutting_down = self.shutting_down.load(Ordering::Acquire);
        match writer::append_tsd(&self.pool, &self.clock, handle, value, utc_wait_ms, shutting_down, policy) {
            Err(StoreError::OutOfMemory) if self.disk.is_some() => {
                // Pressure-relieve synchronously and retry the append once.
                self.force_spool(handle.source);
                writer::append_tsd(&self.pool, &self.clock, handle, value, utc_wait_ms, shutting_down, policy)
                    .inspect_err(|_| self.count_drop(handle))
            }
            Err(e) => {
                if matches!(e, StoreError::OutOfMemory | StoreError::AllPending { .. }) {
                    self.count_drop(handle);
                }
                Err(e)
            }
            ok => ok,
        }
    }

    /// Append one event pair with its caller-supplied timestamp.
    pub fn write_evt(
        &self,
        handle: &SensorHandle,
        value: u32,
        utc_ms: u64,
        utc_wait_ms: u64,
    ) -> Result<()> {
        let policy = self.full_policy();
        let shutting_down = self.shutting_down.load(Ordering::Acquire);
        match writer::append_evt(&self.pool, &self.clock, handle, value, utc_ms, utc_wait_ms, shutting_down, policy) {
            Err(StoreError::OutOfMemory) if self.disk.is_some() => {
                self.force_spool(handle.source);
                writer::append_evt(&self.pool, &self.clock, handle, value, utc_ms, utc_wait_ms, shutting_down, policy)
                    .inspect_err(|_| self.count_drop(handle))
            }
            Err(e) => {
                if matches!(e, StoreError::OutOfMemory | StoreError::AllPending { .. }) {
                    self.count_drop(handle);
                }
                Err(e)
            }
            ok => ok,
        }
    }

    fn full_policy(&self) -> FullPolicy {
        if self.disk.is_some() {
            FullPolicy::ReportFull
        } else {
            FullPolicy::DiscardOldest
        }
    }

    fn count_drop(&self, handle: &SensorHandle) {
        handle.state.lock().dropped_records += 1;
    }

    // ─────────────────────────── reads ─────────────────────────────────

    /// Records `source` has not yet read. Authoritative; never derived by
    /// iteration.
    pub fn new_sample_count(&self, source: UploadSource, handle: &SensorHandle) -> u64 {
        let state = handle.state.lock();
        (state.total_records + state.total_disk_records)
            .saturating_sub(state.pending[source.index()].count as u64)
    }

    /// Bulk-read up to `requested` records for `source`, disk stream
    /// first, then RAM, appending to `out`. Read records become pending
    /// until acked or reverted. Returns the number delivered.
    pub fn read_bulk(
        &self,
        source: UploadSource,
        handle: &SensorHandle,
        out: &mut Vec<TsdEvtValue>,
        requested: usize,
    ) -> Result<u32> {
        if requested == 0 {
            return Ok(0);
        }
        if !handle.state.lock().active {
            return Err(StoreError::InactiveSensor { id: handle.config.id });
        }
        let rate = handle.config.kind.sample_rate_ms();
        let mut delivered: u32 = 0;

        if let Some(disk) = &self.disk {
            let mut src_state = disk.sources[handle.source.index()].lock();
            let n = disk_reader::read_values(
                &mut src_state,
                source,
                handle.config.id,
                rate,
                out,
                requested,
            );
            drop(src_state);
            if n > 0 {
                let mut state = handle.state.lock();
                state.pending[source.index()].count += n;
                state.pending[source.index()].disk_pending += n;
                delivered += n;
            }
        }
        if (delivered as usize) < requested {
            delivered +=
                reader::read_ram(&self.pool, handle, source, out, requested - delivered as usize)?;
        }
        Ok(delivered)
    }

    /// Nack: make every pending record for `source` readable again, disk
    /// and RAM. Idempotent.
    pub fn revert_all_pending(&self, source: UploadSource, handle: &SensorHandle) -> Result<()> {
        {
            let mut state = handle.state.lock();
            if !state.active {
                return Err(StoreError::InactiveSensor { id: handle.config.id });
            }
            let dp = state.pending[source.index()].disk_pending;
            state.pending[source.index()].disk_pending = 0;
            state.pending[source.index()].count -= dp;
        }
        reader::revert_ram(&self.pool, handle, source)?;
        if let Some(disk) = &self.disk {
            let mut src_state = disk.sources[handle.source.index()].lock();
            disk_reader::revert_cursor(&mut src_state, source, handle.config.id);
        }
        Ok(())
    }

    /// Ack `record_count` pending records for `source`, oldest first.
    /// Fully consumed sectors and files are reclaimed.
    pub fn erase_all_pending(
        &self,
        source: UploadSource,
        handle: &SensorHandle,
        record_count: u32,
    ) -> Result<()> {
        let (disk_take, ram_take) = {
            let state = handle.state.lock();
            if !state.active {
                return Err(StoreError::InactiveSensor { id: handle.config.id });
            }
            let cursor = &state.pending[source.index()];
            if record_count > cursor.count {
                return Err(StoreError::InvalidParameter(format!(
                    "erase of {record_count} records exceeds {} pending",
                    cursor.count
                )));
            }
            let disk_take = record_count.min(cursor.disk_pending);
            (disk_take, record_count - disk_take)
        };

        if disk_take > 0 {
            let released = {
                let disk = self.disk.as_ref().ok_or_else(|| {
                    StoreError::InvalidParameter("disk records pending without a disk tier".into())
                })?;
                let mut src_state = disk.sources[handle.source.index()].lock();
                let (_acked, released) =
                    disk_reader::erase_values(&mut src_state, source, handle.config.id, disk_take);
                released
            };
            let mut state = handle.state.lock();
            let cursor = &mut state.pending[source.index()];
            cursor.disk_pending -= disk_take;
            cursor.disk_acked += disk_take as u64;
            cursor.count -= disk_take;
            state.total_disk_records = state.total_disk_records.saturating_sub(released as u64);
        }
        if ram_take > 0 {
            let mut state = handle.state.lock();
            reader::erase_ram(&self.pool, handle, &mut state, source, ram_take)?;
        }
        Ok(())
    }

    // ──────────────────────── recovery / tick ──────────────────────────

    /// Rebuild a sensor's disk view from its source directory. Must run
    /// before the sensor's first write after boot.
    pub fn recover_sensor(&self, handle: &SensorHandle) -> Result<recovery::RecoveryReport> {
        let disk = self.disk.as_ref().ok_or_else(|| StoreError::RecoveryFailed {
            id: handle.config.id,
            reason: "engine has no disk tier".into(),
        })?;
        let now_ms = self.clock.now_utc_ms().unwrap_or(0);
        let mut src_state = disk.sources[handle.source.index()].lock();
        recovery::recover_sensor(&mut src_state, &disk.journal, handle, now_ms)
    }

    /// Periodic driver: rollover detection, spool machines, UTC backfill.
    /// Never returns an error; failures are logged and counted.
    pub fn tick(&self, now_ms: u64) {
        self.clock.observe_tick(now_ms);
        let Some(disk) = &self.disk else { return };
        for source in ALL_SOURCES {
            let sensors = self.sensors_of(source);
            let ctx = SpoolContext {
                pool: &self.pool,
                clock: &self.clock,
                sensors: &sensors,
                cfg: &disk.cfg,
                journal: &disk.journal,
            };
            let mut src_state = disk.sources[source.index()].lock();
            machine::tick_source(&mut src_state, &ctx);
            machine::backfill_utc(&mut src_state, &self.clock);
        }
    }

    /// Drive a full spool cycle for `source` synchronously, ignoring the
    /// pressure gate. Used by the write path and deactivate flush.
    pub fn force_spool(&self, source: UploadSource) {
        let Some(disk) = &self.disk else { return };
        let sensors = self.sensors_of(source);
        let ctx = SpoolContext {
            pool: &self.pool,
            clock: &self.clock,
            sensors: &sensors,
            cfg: &disk.cfg,
            journal: &disk.journal,
        };
        let mut src_state = disk.sources[source.index()].lock();
        if src_state.machine.phase == SpoolPhase::Idle {
            src_state.machine.phase = SpoolPhase::Selecting;
        }
        for _ in 0..FORCED_SPOOL_TICKS {
            machine::tick_source(&mut src_state, &ctx);
            if matches!(src_state.machine.phase, SpoolPhase::Idle | SpoolPhase::Error) {
                break;
            }
        }
    }

    // ─────────────────────────── shutdown ──────────────────────────────

    /// Reject all further writes; called once when power-down begins.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        info!("Engine shutdown flagged, writes will be rejected");
    }

    /// Emergency-flush a sensor's RAM chain straight to disk, fsyncing
    /// per sector, within `deadline_ms`.
    pub fn shutdown_sensor(&self, handle: &SensorHandle, deadline_ms: u64) -> Result<u32> {
        self.shutting_down.store(true, Ordering::Release);
        let disk = self.disk.as_ref().ok_or_else(|| {
            StoreError::InvalidParameter("emergency spool requires a disk tier".into())
        })?;
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let sector_type = handle.config.kind.sector_type();

        // Snapshot the chain under the sensor lock; all I/O happens after.
        let sectors: Vec<emergency::EmergencySector> = {
            let state = handle.state.lock();
            let mut collected = Vec::new();
            let mut cur = state.ram_start;
            let mut guard: usize = 0;
            while cur != NULL_SECTOR_ID && guard <= self.pool.capacity() {
                guard += 1;
                let Ok(entry) = self.pool.entry(cur) else { break };
                if !entry.in_use {
                    break;
                }
                if !entry.pending_ack && !entry.spooled_to_disk && !entry.spool_pending {
                    let records = state.records_in_sector(cur, sector_type)
                        + state.first_record_in_sector(cur, sector_type);
                    if records > 0 {
                        if let Ok(payload) = self.pool.payload(cur) {
                            collected.push(emergency::EmergencySector {
                                sector_id: cur,
                                sector_type: entry.sector_type,
                                record_count: records,
                                timestamp_ms: entry.created_ms,
                                payload,
                            });
                        }
                    }
                }
                cur = entry.next;
            }
            collected
        };
        if sectors.is_empty() {
            return Ok(0);
        }

        let mut src_state = disk.sources[handle.source.index()].lock();
        let outcome =
            emergency::flush_sectors(&src_state.dir, handle.config.id, &sectors, deadline)?;
        src_state.stats.emergency_sectors += outcome.sectors_written as u64;
        info!(source = %handle.source, sensor = handle.config.id,
            written = outcome.sectors_written, complete = outcome.complete,
            "Emergency flush done");
        Ok(outcome.sectors_written)
    }

    // ─────────────────────── diagnostics ───────────────────────────────

    pub fn pool_usage(&self) -> PoolUsage {
        self.pool.usage()
    }

    pub fn sensor_snapshot(&self, handle: &SensorHandle) -> SensorSnapshot {
        handle.snapshot()
    }

    pub fn sensors(&self) -> Vec<Arc<SensorHandle>> {
        self.registry.lock().values().cloned().collect()
    }

    fn sensors_of(&self, source: UploadSource) -> Vec<Arc<SensorHandle>> {
        self.registry
            .lock()
            .iter()
            .filter(|((src, _), _)| *src == source)
            .map(|(_, h)| h.clone())
            .collect()
    }

    /// Walk and verify a sensor's chain. Corruption quarantines the
    /// sensor: further writes are rejected until operator action.
    pub fn validate_chain(&self, handle: &SensorHandle) -> Result<()> {
        let mut state = handle.state.lock();
        let head = state.ram_start;
        if head == NULL_SECTOR_ID {
            return Ok(());
        }
        match self.pool.validate_chain(handle.config.id, head) {
            Ok(()) => Ok(()),
            Err(e) => {
                state.quarantined = true;
                warn!(sensor = handle.config.id, error = %e, "Chain corrupt, sensor quarantined");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        let usage = self.pool.usage();
        let sources = match &self.disk {
            Some(disk) => ALL_SOURCES
                .iter()
                .map(|source| {
                    let src_state = disk.sources[source.index()].lock();
                    SourceStatsView {
                        source: *source,
                        phase: src_state.machine.phase,
                        tracked_files: src_state.tracked.len(),
                        disk_bytes: src_state.total_bytes(),
                        stats: src_state.stats,
                    }
                })
                .collect(),
            None => Vec::new(),
        };
        EngineStats {
            pool_capacity: usage.capacity,
            pool_free: usage.free,
            pool_used_pct: usage.used_pct(),
            sensors: self.registry.lock().len(),
            utc_available: self.clock.utc_available(),
            sources,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sectors", &self.pool.capacity())
            .field("tiered", &self.disk.is_some())
            .finish()
    }
}
