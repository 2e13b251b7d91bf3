// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two-tier cache storage for PodCache.
//!
//! The memory tier is a set of independent [`LruPartition`]s, each a
//! bounded-byte LRU with its own lock. [`PodCache`] routes every key to
//! exactly one partition by `djb2(key) % partition_count` and mediates
//! between the partitions and the content-addressed disk tier: when a
//! partition overflows, its least-recently-used entry is spilled to disk;
//! when a memory miss finds the key on disk, the entry is promoted back and
//! the disk copy destroyed. After any completed operation a key lives in at
//! most one tier.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod cache;
mod partition;

pub use cache::{CacheStats, PartitionStats, PodCache, StoreError};
pub use partition::{LruPartition, PutOutcome, TailEntry};

/// DJB2, the 32-bit string hash used for partition routing.
///
/// Deliberately not the on-disk addressing digest: routing only needs a
/// cheap, stable spread over a handful of partitions.
pub fn djb2(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(5381_u32, |hash, &b| {
            hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(u32::from(b))
        })
}
