//! Global quota pool and bin backing memory
//!
//! Every resident bin is charged against a subsystem-wide quota. Memory and
//! quota are released separately: a discarded free bin gives its memory back
//! immediately but keeps its quota charged until the extent allocator
//! reclaims the tombstone.

use crate::core::error::{HiveError, Result};
use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing memory of one bin
pub struct BinMemory {
    data: Box<[u8]>,
}

impl BinMemory {
    fn new(size: u32) -> Self {
        BinMemory {
            data: vec![0u8; size as usize].into_boxed_slice(),
        }
    }

    /// Allocation size in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for BinMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinMemory").field("size", &self.size()).finish()
    }
}

/// Subsystem-wide accounting of bin memory and quota
pub struct QuotaPool {
    limit: u64,
    charged: CachePadded<AtomicU64>,
    resident: CachePadded<AtomicU64>,
    released_bins: AtomicU64,
}

impl QuotaPool {
    pub fn new(limit: u64) -> Self {
        QuotaPool {
            limit,
            charged: CachePadded::new(AtomicU64::new(0)),
            resident: CachePadded::new(AtomicU64::new(0)),
            released_bins: AtomicU64::new(0),
        }
    }

    /// Reserve `bytes` of quota, failing without side effects if the pool is exhausted
    pub fn charge(&self, bytes: u64) -> Result<()> {
        let mut current = self.charged.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.limit {
                return Err(HiveError::QuotaExceeded {
                    requested: bytes,
                    available: self.limit.saturating_sub(current),
                });
            }
            match self.charged.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return quota to the pool
    pub fn credit(&self, bytes: u64) {
        let previous = self.charged.fetch_sub(bytes, Ordering::AcqRel);
        assert!(
            previous >= bytes,
            "quota underflow: crediting {} bytes with only {} charged",
            bytes,
            previous
        );
    }

    pub(crate) fn allocate_memory(&self, size: u32) -> BinMemory {
        self.resident.fetch_add(size as u64, Ordering::AcqRel);
        BinMemory::new(size)
    }

    /// Drop bin memory, returning the number of bytes released
    pub(crate) fn release_memory(&self, memory: BinMemory) -> u32 {
        let size = memory.size();
        self.resident.fetch_sub(size as u64, Ordering::AcqRel);
        self.released_bins.fetch_add(1, Ordering::Relaxed);
        drop(memory);
        size
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes of quota currently charged
    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::Acquire)
    }

    /// Bytes of bin memory currently resident
    pub fn resident(&self) -> u64 {
        self.resident.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.charged())
    }

    /// Number of bin allocations physically released so far
    pub fn released_bins(&self) -> u64 {
        self.released_bins.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for QuotaPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaPool")
            .field("limit", &self.limit)
            .field("charged", &self.charged())
            .field("resident", &self.resident())
            .finish()
    }
}
