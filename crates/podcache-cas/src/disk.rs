// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem-backed content-addressed store.
//!
//! [`DiskTier`] owns a private base directory (`<root_prefix><8-hex-random>`)
//! and stores one entry per key under the digest fan-out described in the
//! crate docs. The filesystem layout is the source of truth; the registry is
//! a convenience index of stored leaf paths for eviction bookkeeping and
//! status reporting. The base directory is removed recursively when the tier
//! is dropped, so spilled data does not survive a clean shutdown.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{CasError, KeyDigest};

const VALUE_FILE: &str = "value.dat";
const TIME_FILE: &str = "time.dat";

/// Content-addressed disk store for spilled cache entries.
///
/// All methods take `&self`; the registry is guarded by an internal mutex so
/// the tier is safe to share across partitions. Per-key filesystem traffic is
/// additionally serialized by the owning partition's lock in the coordinator,
/// so no two operations race on the same leaf directory.
pub struct DiskTier {
    base_path: PathBuf,
    registry: Mutex<Vec<PathBuf>>,
}

impl DiskTier {
    /// Create a tier rooted at `<root_prefix><8-hex-random>`.
    ///
    /// The suffix is appended to the prefix without a separator: a prefix of
    /// `/var/cache/` yields `/var/cache/1a2b3c4d`, a prefix of `./` yields a
    /// directory in the working directory. Each process gets a private
    /// namespace; instances sharing a prefix coexist as sibling directories.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the base directory cannot be created.
    pub fn create(root_prefix: &str) -> Result<Self, CasError> {
        let suffix: u32 = rand::random();
        let base_path = PathBuf::from(format!("{root_prefix}{suffix:08x}"));
        fs::create_dir_all(&base_path).map_err(|source| CasError::Io {
            op: "mkdir",
            path: base_path.clone(),
            source,
        })?;
        Ok(Self {
            base_path,
            registry: Mutex::new(Vec::new()),
        })
    }

    /// The tier's private base directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Number of leaf paths currently recorded in the registry.
    pub fn entry_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// Store `value` under `key`, replacing any previous entry for the key.
    ///
    /// Writes `value.dat` (the raw bytes) and `time.dat` (the UNIX creation
    /// timestamp in decimal text) into the key's leaf directory and returns
    /// that directory's path. The caller records the path via
    /// [`add_to_registry`](Self::add_to_registry) once the spill completes.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] on directory creation or write failure.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<PathBuf, CasError> {
        let leaf = self.leaf_dir(&KeyDigest::from_key(key));
        if leaf.exists() {
            // Idempotent overwrite: the key's previous layout goes first.
            fs::remove_dir_all(&leaf).map_err(|source| CasError::Io {
                op: "remove",
                path: leaf.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&leaf).map_err(|source| CasError::Io {
            op: "mkdir",
            path: leaf.clone(),
            source,
        })?;

        let value_path = leaf.join(VALUE_FILE);
        fs::write(&value_path, value).map_err(|source| CasError::Io {
            op: "write",
            path: value_path,
            source,
        })?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let time_path = leaf.join(TIME_FILE);
        fs::write(&time_path, now.to_string()).map_err(|source| CasError::Io {
            op: "write",
            path: time_path,
            source,
        })?;

        Ok(leaf)
    }

    /// Retrieve the value stored under `key`, or `None` if the key has no
    /// on-disk entry. Absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] on read failure and [`CasError::ShortRead`]
    /// if the file yields fewer bytes than its recorded size.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CasError> {
        let leaf = self.leaf_dir(&KeyDigest::from_key(key));
        let value_path = leaf.join(VALUE_FILE);
        let Ok(meta) = fs::metadata(&value_path) else {
            return Ok(None);
        };
        let want = usize::try_from(meta.len()).unwrap_or(usize::MAX);
        let bytes = fs::read(&value_path).map_err(|source| CasError::Io {
            op: "read",
            path: value_path.clone(),
            source,
        })?;
        if bytes.len() < want {
            return Err(CasError::ShortRead {
                path: value_path,
                got: bytes.len(),
                want,
            });
        }
        Ok(Some(bytes))
    }

    /// Remove the on-disk entry for `key`: both data files, then the four
    /// fan-out directories bottom-up. Every fan-out chain belongs to a single
    /// digest, so the directories are empty once the files are gone.
    ///
    /// Returns `true` if an entry was removed, `false` if the key had no
    /// on-disk entry.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if any removal fails; the registry keeps its
    /// entry in that case.
    pub fn evict(&self, key: &[u8]) -> Result<bool, CasError> {
        let leaf = self.leaf_dir(&KeyDigest::from_key(key));
        let value_path = leaf.join(VALUE_FILE);
        if !value_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&value_path).map_err(|source| CasError::Io {
            op: "remove",
            path: value_path,
            source,
        })?;
        let time_path = leaf.join(TIME_FILE);
        if time_path.exists() {
            fs::remove_file(&time_path).map_err(|source| CasError::Io {
                op: "remove",
                path: time_path,
                source,
            })?;
        }

        let mut dir = leaf.clone();
        for _ in 0..4 {
            fs::remove_dir(&dir).map_err(|source| CasError::Io {
                op: "rmdir",
                path: dir.clone(),
                source,
            })?;
            dir.pop();
        }

        self.lock_registry().retain(|p| p != &leaf);
        Ok(true)
    }

    /// Record a stored leaf path in the registry.
    pub fn add_to_registry(&self, leaf: PathBuf) {
        self.lock_registry().push(leaf);
    }

    fn leaf_dir(&self, digest: &KeyDigest) -> PathBuf {
        let chunks = digest.path_chunks();
        let mut path = self.base_path.clone();
        for chunk in &chunks {
            path.push(chunk);
        }
        path
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        // The registry is a plain Vec; a panic mid-push cannot leave it in a
        // state the other operations can't handle.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        // Best-effort teardown of the process-private namespace.
        let _ = fs::remove_dir_all(&self.base_path);
    }
}
