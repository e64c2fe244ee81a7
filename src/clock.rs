// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Time authority.
//!
//! The engine never reads the OS clock directly; every timestamp flows
//! through here. On the gateway profile UTC comes from the system clock and
//! is always available. On the embedded profile UTC is unknown until the
//! caller supplies a reference after an external sync, and TSD/EVT writes
//! gate on it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};

use crate::config::TimeSource;
use crate::error::{Result, StoreError};

/// Clock jumps backwards by more than this are treated as a rollover.
const ROLLOVER_TOLERANCE_MS: u64 = 5_000;

#[derive(Debug, Default)]
struct ExternalClock {
    /// UTC-ms supplied by the caller, paired with the instant it was set.
    reference: Option<(u64, Instant)>,
}

/// Shared clock handle. Cheap to clone via the owning engine's `Arc`.
pub struct TimeAuthority {
    source: TimeSource,
    external: Mutex<ExternalClock>,
    available: Condvar,
    /// Last timestamp observed by the tick, for rollover detection.
    last_seen_ms: AtomicU64,
    /// Incremented on every detected rollover. Writers compare the value
    /// captured at sector allocation to decide whether the tail must be
    /// closed before the next append.
    rollover_generation: AtomicU64,
    backfill_delta_ms: AtomicI64,
    backfill_delta_known: AtomicBool,
}

impl TimeAuthority {
    pub fn new(source: TimeSource) -> Self {
        Self {
            source,
            external: Mutex::new(ExternalClock::default()),
            available: Condvar::new(),
            last_seen_ms: AtomicU64::new(0),
            rollover_generation: AtomicU64::new(0),
            backfill_delta_ms: AtomicI64::new(0),
            backfill_delta_known: AtomicBool::new(false),
        }
    }

    /// Current UTC in milliseconds, or `None` before an external sync.
    pub fn now_utc_ms(&self) -> Option<u64> {
        match self.source {
            TimeSource::System => Some(Utc::now().timestamp_millis() as u64),
            TimeSource::External => {
                let clock = self.external.lock();
                clock.reference.map(|(utc_ms, at)| utc_ms + at.elapsed().as_millis() as u64)
            }
            TimeSource::Manual => self.external.lock().reference.map(|(utc_ms, _)| utc_ms),
        }
    }

    pub fn utc_available(&self) -> bool {
        match self.source {
            TimeSource::System => true,
            TimeSource::External | TimeSource::Manual => self.external.lock().reference.is_some(),
        }
    }

    /// Supply a reference time after an external sync. Unblocks gated
    /// writers and fixes the backfill delta for records stamped with the
    /// pre-sync local clock.
    pub fn set_reference_utc_ms(&self, utc_ms: u64) {
        let mut clock = self.external.lock();
        if clock.reference.is_none() {
            let local = self.last_seen_ms.load(Ordering::Acquire);
            self.backfill_delta_ms.store(utc_ms as i64 - local as i64, Ordering::Release);
            self.backfill_delta_known.store(true, Ordering::Release);
        }
        clock.reference = Some((utc_ms, Instant::now()));
        drop(clock);
        self.available.notify_all();
    }

    /// Milliseconds to add to a pre-sync local timestamp to obtain UTC.
    /// Known only after the first external sync.
    pub fn backfill_delta_ms(&self) -> Option<i64> {
        if self.backfill_delta_known.load(Ordering::Acquire) {
            Some(self.backfill_delta_ms.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Current UTC, waiting up to `max_wait_ms` for an external sync.
    ///
    /// Returns `Timeout` when the wait elapses with UTC still unknown;
    /// `max_wait_ms == 0` fails immediately.
    pub fn utc_or_wait(&self, max_wait_ms: u64) -> Result<u64> {
        if self.source == TimeSource::System {
            return Ok(Utc::now().timestamp_millis() as u64);
        }
        let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
        let mut clock = self.external.lock();
        loop {
            if let Some((utc_ms, at)) = clock.reference {
                return Ok(match self.source {
                    TimeSource::Manual => utc_ms,
                    _ => utc_ms + at.elapsed().as_millis() as u64,
                });
            }
            if max_wait_ms == 0
                || self.available.wait_until(&mut clock, deadline).timed_out()
            {
                return Err(StoreError::Timeout { waited_ms: max_wait_ms });
            }
        }
    }

    /// Tick-side rollover watch. Returns `true` when the clock jumped
    /// backwards past the tolerance; open TSD tails are closed before their
    /// next append so post-rollover values land in freshly stamped sectors.
    pub fn observe_tick(&self, now_ms: u64) -> bool {
        let last = self.last_seen_ms.swap(now_ms, Ordering::AcqRel);
        if last > now_ms && last - now_ms > ROLLOVER_TOLERANCE_MS {
            let generation = self.rollover_generation.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::warn!(last_seen_ms = last, now_ms, generation, "Clock rollover detected");
            return true;
        }
        false
    }

    pub fn rollover_generation(&self) -> u64 {
        self.rollover_generation.load(Ordering::Acquire)
    }
}
