// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed disk tier for PodCache.
//!
//! `podcache-cas` provides [`DiskTier`], the cold tier that the in-memory
//! cache spills into under byte pressure. Entries are addressed by
//! [`KeyDigest`] — the SHA-256 of the *key* bytes — fanned out over four
//! directory levels of 16 hex characters each:
//!
//! ```text
//! <base_path>/<hex16>/<hex16>/<hex16>/<hex16>/{value.dat, time.dat}
//! ```
//!
//! # Hash Domain Policy
//!
//! The digest covers the key only, never the value: a key's on-disk location
//! is stable across overwrites. This digest is reserved for disk addressing —
//! partition routing in the memory tier uses an unrelated 32-bit hash and the
//! two must not be mixed.
//!
//! # Absence Semantics
//!
//! [`get`](DiskTier::get) returns `None` for entries that were never spilled
//! (or were promoted back to memory) — absence is **not** an error. Error
//! variants are reserved for I/O failures.
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

mod disk;
pub use disk::DiskTier;

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// A 32-byte SHA-256 digest of a cache key.
///
/// Thin newtype over `[u8; 32]`. The inner bytes are public for zero-cost
/// access; the `Display` impl renders the canonical 64-character lowercase
/// hex form used for on-disk addressing.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct KeyDigest(pub [u8; 32]);

impl KeyDigest {
    /// Compute the digest of `key`.
    pub fn from_key(key: &[u8]) -> Self {
        let hash = Sha256::digest(key);
        Self(hash.into())
    }

    /// View the digest as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The four 16-hex-character path chunks the fan-out tree is built from.
    pub fn path_chunks(&self) -> [String; 4] {
        let hex = self.to_string();
        [0usize, 1, 2, 3].map(|i| hex[i * 16..(i + 1) * 16].to_owned())
    }
}

impl std::fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors that can occur during disk-tier operations.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// A filesystem operation failed.
    #[error("[CAS_IO] {op} {}: {source}", .path.display())]
    Io {
        /// The operation that failed (`mkdir`, `write`, `read`, `remove`).
        op: &'static str,
        /// The path it failed on.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// A stored value file yielded fewer bytes than its recorded size.
    #[error("[CAS_SHORT_READ] {}: read {got} of {want} bytes", .path.display())]
    ShortRead {
        /// The value file that was truncated underneath us.
        path: PathBuf,
        /// Bytes actually read.
        got: usize,
        /// Bytes the file size promised.
        want: usize,
    },
}
