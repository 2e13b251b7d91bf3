// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two-tier coordinator.
//!
//! [`PodCache`] owns the partitioned memory tier and the disk tier and
//! implements the traffic between them. Every operation first selects the
//! owning partition (`djb2(key) % partition_count`) and takes its lock; the
//! lock stays held across any disk traffic the operation triggers. The
//! half-moved states of a spill (disk copy written, memory copy not yet
//! popped) and of a promotion (memory copy inserted, disk copy not yet
//! removed) are therefore never observable.

use std::sync::{Mutex, MutexGuard, PoisonError};

use podcache_cas::{CasError, DiskTier};
use tracing::{debug, info};

use crate::djb2;
use crate::partition::{LruPartition, PutOutcome};

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The value cannot fit a partition even after evicting everything.
    #[error("value of {size} bytes cannot fit a partition of {capacity} bytes")]
    ValueTooLarge {
        /// Size of the rejected value.
        size: usize,
        /// Byte budget of one partition.
        capacity: usize,
    },
    /// `incr` found a value that is not an ASCII signed decimal, or the
    /// increment overflowed.
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    /// The disk tier failed.
    #[error(transparent)]
    Disk(#[from] CasError),
}

/// Occupancy snapshot of one partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionStats {
    /// Live entries in the partition.
    pub entries: usize,
    /// Bytes of value data currently held.
    pub used_bytes: usize,
    /// The partition's byte budget.
    pub capacity: usize,
}

/// Occupancy snapshot of the whole cache, for the periodic status report.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Per-partition occupancy, in partition order.
    pub partitions: Vec<PartitionStats>,
    /// Entries currently spilled to the disk tier.
    pub disk_entries: usize,
}

/// The two-tier cache: partitioned in-memory LRU over a content-addressed
/// disk spill store.
pub struct PodCache {
    partitions: Vec<Mutex<LruPartition>>,
    disk: DiskTier,
    total_capacity: usize,
    partition_capacity: usize,
}

impl PodCache {
    /// Create a cache with `total_capacity` bytes split evenly across
    /// `partition_count` partitions, spilling to a fresh private directory
    /// under `fsroot_prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Disk`] if the disk tier's base directory cannot
    /// be created.
    pub fn new(
        total_capacity: usize,
        partition_count: usize,
        fsroot_prefix: &str,
    ) -> Result<Self, StoreError> {
        let partition_count = partition_count.max(1);
        let partition_capacity = total_capacity / partition_count;
        let partitions = (0..partition_count)
            .map(|_| Mutex::new(LruPartition::with_capacity(partition_capacity)))
            .collect();
        let disk = DiskTier::create(fsroot_prefix)?;
        info!(
            total_capacity,
            partition_count,
            partition_capacity,
            base_path = %disk.base_path().display(),
            "cache created"
        );
        Ok(Self {
            partitions,
            disk,
            total_capacity,
            partition_capacity,
        })
    }

    /// Total byte budget across all partitions.
    pub fn total_capacity(&self) -> usize {
        self.total_capacity
    }

    /// Byte budget of each partition.
    pub fn partition_capacity(&self) -> usize {
        self.partition_capacity
    }

    /// Number of memory-tier partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The disk tier backing this cache.
    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// The partition that owns `key`.
    pub fn partition_index(&self, key: &[u8]) -> usize {
        djb2(key) as usize % self.partitions.len()
    }

    /// Store `value` under `key`, spilling LRU entries to disk as needed.
    /// Returns the index of the partition that took the entry.
    ///
    /// # Errors
    ///
    /// [`StoreError::ValueTooLarge`] if the value exceeds the partition
    /// budget; [`StoreError::Disk`] if a spill fails.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<usize, StoreError> {
        let index = self.partition_index(key);
        let mut partition = self.lock_partition(index);
        self.store_with_spill(index, &mut partition, key, value)?;
        // The entry now lives in memory; a spilled copy from an earlier
        // overflow would otherwise resurface after a DEL.
        self.disk.evict(key)?;
        Ok(index)
    }

    /// Fetch the value for `key` from memory, falling back to disk.
    ///
    /// A disk hit is promoted: the entry moves back into the owning
    /// partition (spilling colder entries if needed) and the disk copy is
    /// destroyed before the bytes are returned.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disk`] on disk-tier failure, or
    /// [`StoreError::ValueTooLarge`] if a promoted value no longer fits the
    /// partition budget.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let index = self.partition_index(key);
        let mut partition = self.lock_partition(index);
        if let Some(value) = partition.get(key) {
            debug!(partition = index, "memory hit");
            return Ok(Some(value));
        }
        self.promote_from_disk(index, &mut partition, key)
    }

    /// Remove `key` from whichever tier holds it. Returns `true` if a copy
    /// was removed.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disk`] if the disk-tier removal fails.
    pub fn evict(&self, key: &[u8]) -> Result<bool, StoreError> {
        let index = self.partition_index(key);
        let mut partition = self.lock_partition(index);
        if partition.evict(key) {
            debug!(partition = index, "evicted from memory");
            return Ok(true);
        }
        let removed = self.disk.evict(key)?;
        if removed {
            debug!(partition = index, "evicted from disk");
        }
        Ok(removed)
    }

    /// Atomically increment the integer value stored under `key`.
    ///
    /// The read-parse-increment-write sequence runs entirely under the
    /// owning partition's lock, so concurrent increments of one key
    /// serialize. A missing key counts as 0; a disk-resident value is
    /// promoted first, exactly as in [`get`](Self::get).
    ///
    /// # Errors
    ///
    /// [`StoreError::NotAnInteger`] if the stored value is not an ASCII
    /// signed decimal or the increment overflows; tier errors as in `get`
    /// and `put`.
    pub fn incr(&self, key: &[u8]) -> Result<i64, StoreError> {
        let index = self.partition_index(key);
        let mut partition = self.lock_partition(index);
        let current = match partition.get(key) {
            Some(value) => Some(value),
            None => self.promote_from_disk(index, &mut partition, key)?,
        };
        let current = match current {
            None => 0,
            Some(bytes) => parse_decimal(&bytes).ok_or(StoreError::NotAnInteger)?,
        };
        let next = current.checked_add(1).ok_or(StoreError::NotAnInteger)?;
        self.store_with_spill(index, &mut partition, key, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Occupancy snapshot across both tiers.
    pub fn stats(&self) -> CacheStats {
        let partitions = self
            .partitions
            .iter()
            .map(|partition| {
                let partition = partition.lock().unwrap_or_else(PoisonError::into_inner);
                PartitionStats {
                    entries: partition.len(),
                    used_bytes: partition.current_bytes(),
                    capacity: partition.capacity(),
                }
            })
            .collect();
        CacheStats {
            partitions,
            disk_entries: self.disk.entry_count(),
        }
    }

    fn lock_partition(&self, index: usize) -> MutexGuard<'_, LruPartition> {
        // Partition invariants hold at every early return, so a poisoned
        // lock still guards a consistent partition.
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert under the held partition lock, spilling the LRU tail to disk
    /// until the value fits.
    fn store_with_spill(
        &self,
        index: usize,
        partition: &mut LruPartition,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        loop {
            match partition.put(key, value) {
                PutOutcome::Stored => return Ok(()),
                PutOutcome::TooLarge => {
                    return Err(StoreError::ValueTooLarge {
                        size: value.len(),
                        capacity: partition.capacity(),
                    })
                }
                PutOutcome::NeedsEviction => {
                    let leaf = match partition.peek_tail() {
                        Some(tail) => {
                            info!(
                                partition = index,
                                spilled_bytes = tail.value.len(),
                                created = ?tail.created,
                                "partition full, spilling LRU tail to disk"
                            );
                            self.disk.put(tail.key, tail.value)?
                        }
                        // A sub-budget value always fits an empty partition,
                        // so an empty overflow cannot happen; treat it as the
                        // value being unstorable rather than looping.
                        None => {
                            return Err(StoreError::ValueTooLarge {
                                size: value.len(),
                                capacity: partition.capacity(),
                            })
                        }
                    };
                    self.disk.add_to_registry(leaf);
                    partition.pop_tail();
                }
            }
        }
    }

    /// Disk-tier lookup plus promotion, under the held partition lock.
    fn promote_from_disk(
        &self,
        index: usize,
        partition: &mut LruPartition,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(bytes) = self.disk.get(key)? else {
            debug!(partition = index, "miss in both tiers");
            return Ok(None);
        };
        self.store_with_spill(index, partition, key, &bytes)?;
        self.disk.evict(key)?;
        info!(
            partition = index,
            promoted_bytes = bytes.len(),
            "promoted entry from disk to memory"
        );
        Ok(Some(bytes))
    }
}

/// Strict ASCII signed-decimal parse for `incr`.
fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
