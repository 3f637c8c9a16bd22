// crates/datatrail-store-sqlite/src/payload.rs
// ============================================================================
// Module: Datatrail Filesystem Payload Store
// Description: Content-addressed blob storage on the local filesystem.
// Purpose: Persist row and payload bytes keyed by their content hash.
// Dependencies: datatrail-core, std::fs
// ============================================================================

//! ## Overview
//! Payloads are stored under a two-level hex fan-out derived from their
//! SHA-256 content hash. Writes are idempotent: identical content yields the
//! identical reference and the file is written once. Loads of purged or
//! never-stored references return `None`; deletes of missing references are
//! not errors. Content addressing makes the store multi-writer safe.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use datatrail_core::DEFAULT_HASH_ALGORITHM;
use datatrail_core::PayloadError;
use datatrail_core::PayloadRef;
use datatrail_core::PayloadStore;
use datatrail_core::hash_bytes;

// ============================================================================
// SECTION: Store
// ============================================================================

/// Content-addressed payload store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    /// Root directory of the store.
    root: PathBuf,
}

impl FsPayloadStore {
    /// Creates a store rooted at the given directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| PayloadError::Io(err.to_string()))?;
        Ok(Self { root })
    }

    /// Returns the blob path for a reference.
    fn blob_path(&self, reference: &PayloadRef) -> Option<PathBuf> {
        let hex = reference.as_str();
        if hex.len() < 4 || !hex.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex))
    }
}

impl PayloadStore for FsPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<PayloadRef, PayloadError> {
        let reference = PayloadRef::new(hash_bytes(DEFAULT_HASH_ALGORITHM, bytes).value);
        let path = self
            .blob_path(&reference)
            .ok_or_else(|| PayloadError::Io("derived reference is not hex".to_string()))?;
        if path.exists() {
            return Ok(reference);
        }
        let parent = path
            .parent()
            .ok_or_else(|| PayloadError::Io("blob path has no parent".to_string()))?;
        fs::create_dir_all(parent).map_err(|err| PayloadError::Io(err.to_string()))?;
        // Write to a sibling temp file and rename so readers never observe a
        // partial blob.
        let temporary = path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&temporary).map_err(|err| PayloadError::Io(err.to_string()))?;
            file.write_all(bytes).map_err(|err| PayloadError::Io(err.to_string()))?;
            file.sync_all().map_err(|err| PayloadError::Io(err.to_string()))?;
        }
        fs::rename(&temporary, &path).map_err(|err| PayloadError::Io(err.to_string()))?;
        Ok(reference)
    }

    fn load(&self, reference: &PayloadRef) -> Result<Option<Vec<u8>>, PayloadError> {
        let Some(path) = self.blob_path(reference) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PayloadError::Io(err.to_string())),
        }
    }

    fn delete(&self, reference: &PayloadRef) -> Result<(), PayloadError> {
        let Some(path) = self.blob_path(reference) else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PayloadError::Io(err.to_string())),
        }
    }
}
