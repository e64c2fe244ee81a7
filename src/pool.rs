// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Global sector pool — bounded allocator for raw sector storage and chain
//! metadata.
//!
//! Sectors are bare 32-byte payloads in a fixed arena; per-sector metadata
//! lives in a parallel chain table threaded by integer ids, so chains are
//! plain index lists and cycles are detectable without chasing heap
//! pointers. One coarse lock guards the arena, the chain table, and the
//! free list; every critical section is O(1) or a bounded walk, and disk
//! I/O is never performed while it is held.

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::sector::{SectorId, SectorType, NULL_SECTOR_ID, SECTOR_PAYLOAD_BYTES};

/// Parallel metadata for one sector.
#[derive(Debug, Clone, Copy)]
pub struct ChainEntry {
    pub owner_sensor_id: u32,
    pub next: SectorId,
    pub sector_type: SectorType,
    pub in_use: bool,
    /// Set while any upload source holds records of this sector in a
    /// pending (read but unacked) window.
    pub pending_ack: bool,
    /// Set once the spooler has durably written this sector to disk.
    pub spooled_to_disk: bool,
    /// Set while the spooler has this sector claimed for an in-flight
    /// write. Readers stop at claimed sectors so a record is never
    /// delivered from RAM and disk both.
    pub spool_pending: bool,
    pub created_ms: u64,
}

impl ChainEntry {
    fn vacant() -> Self {
        ChainEntry {
            owner_sensor_id: 0,
            next: NULL_SECTOR_ID,
            sector_type: SectorType::Tsd,
            in_use: false,
            pending_ack: false,
            spooled_to_disk: false,
            spool_pending: false,
            created_ms: 0,
        }
    }
}

struct PoolInner {
    sectors: Vec<[u8; SECTOR_PAYLOAD_BYTES]>,
    chain: Vec<ChainEntry>,
    /// Stack of free sector ids; top is allocated next.
    free_list: Vec<SectorId>,
}

/// Fixed arena of sectors plus the chain table. All mutation goes through
/// the single internal lock.
pub struct SectorPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

/// Snapshot of pool occupancy for stats and pressure checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub capacity: usize,
    pub free: usize,
}

impl PoolUsage {
    pub fn used(&self) -> usize {
        self.capacity - self.free
    }

    /// Occupancy as a whole percentage.
    pub fn used_pct(&self) -> u8 {
        if self.capacity == 0 {
            return 0;
        }
        ((self.used() * 100) / self.capacity) as u8
    }
}

impl SectorPool {
    /// Create a pool of `sector_count` sectors, all free.
    pub fn new(sector_count: usize) -> Self {
        let capacity = sector_count.min(NULL_SECTOR_ID as usize);
        // Free in reverse so allocation starts at sector 0.
        let free_list: Vec<SectorId> = (0..capacity).rev().map(|i| i as SectorId).collect();
        SectorPool {
            inner: Mutex::new(PoolInner {
                sectors: vec![[0u8; SECTOR_PAYLOAD_BYTES]; capacity],
                chain: vec![ChainEntry::vacant(); capacity],
                free_list,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn usage(&self) -> PoolUsage {
        let inner = self.inner.lock();
        PoolUsage { capacity: self.capacity, free: inner.free_list.len() }
    }

    /// Pop the free list and stamp the entry. `None` when the pool is empty.
    pub fn allocate(
        &self,
        owner_sensor_id: u32,
        sector_type: SectorType,
        created_ms: u64,
    ) -> Option<SectorId> {
        let mut inner = self.inner.lock();
        let id = inner.free_list.pop()?;
        let entry = &mut inner.chain[id as usize];
        *entry = ChainEntry {
            owner_sensor_id,
            next: NULL_SECTOR_ID,
            sector_type,
            in_use: true,
            pending_ack: false,
            spooled_to_disk: false,
            spool_pending: false,
            created_ms,
        };
        inner.sectors[id as usize] = [0u8; SECTOR_PAYLOAD_BYTES];
        Some(id)
    }

    /// Return a sector to the free list. The entry must be in use.
    pub fn free(&self, id: SectorId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .chain
            .get_mut(id as usize)
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {id} out of range")))?;
        if !entry.in_use {
            return Err(StoreError::InvalidParameter(format!("sector {id} is not in use")));
        }
        *entry = ChainEntry::vacant();
        inner.free_list.push(id);
        Ok(())
    }

    /// Copy of the chain entry for `id`.
    pub fn entry(&self, id: SectorId) -> Result<ChainEntry> {
        let inner = self.inner.lock();
        inner
            .chain
            .get(id as usize)
            .copied()
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {id} out of range")))
    }

    /// Successor of `id` in its chain (`NULL_SECTOR_ID` terminates).
    pub fn next(&self, id: SectorId) -> Result<SectorId> {
        Ok(self.entry(id)?.next)
    }

    /// Append `new` after `tail`. `tail` must currently terminate a chain.
    pub fn link(&self, tail: SectorId, new: SectorId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .chain
            .get_mut(tail as usize)
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {tail} out of range")))?;
        if !entry.in_use {
            return Err(StoreError::InvalidParameter(format!("link tail {tail} not in use")));
        }
        if entry.next != NULL_SECTOR_ID {
            return Err(StoreError::InvalidParameter(format!(
                "link tail {tail} does not terminate its chain"
            )));
        }
        entry.next = new;
        Ok(())
    }

    /// Point `prev`'s link at `next`, bypassing whatever it pointed to.
    /// Used when a middle sector is discarded from a chain.
    pub fn relink(&self, prev: SectorId, next: SectorId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .chain
            .get_mut(prev as usize)
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {prev} out of range")))?;
        if !entry.in_use {
            return Err(StoreError::InvalidParameter(format!("relink source {prev} not in use")));
        }
        entry.next = next;
        Ok(())
    }

    pub fn set_pending_ack(&self, id: SectorId, pending: bool) -> Result<()> {
        self.update_entry(id, |e| e.pending_ack = pending)
    }

    pub fn set_spooled(&self, id: SectorId, spooled: bool) -> Result<()> {
        self.update_entry(id, |e| e.spooled_to_disk = spooled)
    }

    pub fn set_spool_pending(&self, id: SectorId, claimed: bool) -> Result<()> {
        self.update_entry(id, |e| e.spool_pending = claimed)
    }

    fn update_entry(&self, id: SectorId, f: impl FnOnce(&mut ChainEntry)) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .chain
            .get_mut(id as usize)
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {id} out of range")))?;
        if !entry.in_use {
            return Err(StoreError::InvalidParameter(format!("sector {id} is not in use")));
        }
        f(entry);
        Ok(())
    }

    /// Copy out a sector payload.
    pub fn payload(&self, id: SectorId) -> Result<[u8; SECTOR_PAYLOAD_BYTES]> {
        let inner = self.inner.lock();
        inner
            .sectors
            .get(id as usize)
            .copied()
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {id} out of range")))
    }

    /// Mutate a sector payload in place under the pool lock. The closure
    /// must do O(1) work.
    pub fn with_payload_mut<R>(
        &self,
        id: SectorId,
        f: impl FnOnce(&mut [u8; SECTOR_PAYLOAD_BYTES]) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let payload = inner
            .sectors
            .get_mut(id as usize)
            .ok_or_else(|| StoreError::InvalidParameter(format!("sector id {id} out of range")))?;
        Ok(f(payload))
    }

    /// Chain length from `head`, with a cycle guard: a walk longer than the
    /// pool itself cannot be a valid chain.
    pub fn chain_length(&self, owner_sensor_id: u32, head: SectorId) -> Result<u32> {
        let inner = self.inner.lock();
        let mut count: u32 = 0;
        let mut cur = head;
        while cur != NULL_SECTOR_ID {
            let entry = inner.chain.get(cur as usize).ok_or_else(|| StoreError::CorruptChain {
                id: owner_sensor_id,
                reason: format!("link to out-of-range sector {cur}"),
            })?;
            count += 1;
            if count as usize > self.capacity {
                return Err(StoreError::CorruptChain {
                    id: owner_sensor_id,
                    reason: "cycle detected (walk exceeded pool size)".into(),
                });
            }
            cur = entry.next;
        }
        Ok(count)
    }

    /// Walk the chain from `head` verifying in-use flags, uniform ownership
    /// and that no sector is revisited.
    pub fn validate_chain(&self, owner_sensor_id: u32, head: SectorId) -> Result<()> {
        let inner = self.inner.lock();
        let mut visited = vec![false; self.capacity];
        let mut cur = head;
        while cur != NULL_SECTOR_ID {
            let entry = inner.chain.get(cur as usize).ok_or_else(|| StoreError::CorruptChain {
                id: owner_sensor_id,
                reason: format!("link to out-of-range sector {cur}"),
            })?;
            if !entry.in_use {
                return Err(StoreError::CorruptChain {
                    id: owner_sensor_id,
                    reason: format!("sector {cur} linked but not in use"),
                });
            }
            if entry.owner_sensor_id != owner_sensor_id {
                return Err(StoreError::CorruptChain {
                    id: owner_sensor_id,
                    reason: format!(
                        "sector {cur} owned by sensor {}",
                        entry.owner_sensor_id
                    ),
                });
            }
            if visited[cur as usize] {
                return Err(StoreError::CorruptChain {
                    id: owner_sensor_id,
                    reason: format!("sector {cur} revisited (cycle)"),
                });
            }
            visited[cur as usize] = true;
            cur = entry.next;
        }
        Ok(())
    }
}
