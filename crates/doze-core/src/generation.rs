//! Coordinator half of the double-buffered watch-generation broadcast.
//!
//! Two lock files implement a race-free broadcast to an unbounded set of
//! watchers: watchers hold a shared lock on the "current" generation; the
//! coordinator announces suspend by stamping "current" and then taking its
//! exclusive lock, which succeeds only once every watcher has released
//! (acknowledged). Rotating renames "next" into "current" so a watcher
//! attaching after that point sees the new generation, and stamps the old
//! inode so watchers that moved on learn the cycle is over.
//!
//! The two stamps differ in size on purpose: a suspend announcement leaves
//! the file one byte long, the resume stamp makes the old inode two bytes.
//! Watchers filter false alarms and tell the two edges apart by size alone,
//! even when directory notifications coalesce.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::PathBuf;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ControlPaths;

/// Written into "current" when suspend is announced; size 1 marks an
/// in-progress cycle.
pub(crate) const SUSPEND_STAMP: &[u8] = b"\0";
/// Written into the retired generation after rotation; size >= 2 marks
/// resume.
pub(crate) const RESUME_STAMP: &[u8] = b"\0\0";

/// Mode for the generation files.
const GENERATION_FILE_MODE: u32 = 0o640;

/// Errors from generation-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A generation file could not be opened or created.
    #[error("failed to open generation file {path}: {source}")]
    Open {
        /// The generation file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Stamping, locking or rotating failed.
    #[error("generation store operation failed: {0}")]
    Io(#[from] io::Error),
}

/// Identity of a generation file, compared by requesters to distinguish
/// "the machine suspended" from "the request was vetoed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationId {
    /// Device the generation file lives on.
    pub dev: u64,
    /// Inode of the generation file.
    pub ino: u64,
}

/// The coordinator's handle on the generation pair.
#[derive(Debug, Clone)]
pub struct GenerationStore {
    current: PathBuf,
    next: PathBuf,
}

impl GenerationStore {
    /// Store over the configured generation files.
    #[must_use]
    pub fn new(paths: &ControlPaths) -> Self {
        Self {
            current: paths.watching(),
            next: paths.watching_next(),
        }
    }

    /// Create the initial generation pair at startup.
    pub fn init(&self) -> Result<(), StoreError> {
        self.announce()?;
        self.rotate()
    }

    /// Broadcast "suspend is imminent" and wait for every watcher.
    ///
    /// Recreates an empty "next" (watchers will hold their place in the
    /// following cycle there), stamps "current", then takes the exclusive
    /// lock on it - which blocks until every attached watcher has released
    /// its shared lock. There is deliberately no timeout: liveness depends
    /// on cooperative watchers.
    pub fn announce(&self) -> Result<(), StoreError> {
        // A fresh, empty next generation.
        self.open_generation(&self.next, true)?;

        let current = self.open_generation(&self.current, true)?;
        (&current).write_all(SUSPEND_STAMP)?;
        trace!(path = %self.current.display(), "announced suspend, waiting for watchers");
        current.lock_exclusive()?;
        // Exclusive lock proves no watcher remains attached. Dropping the
        // file releases it.
        debug!("all watchers acknowledged");
        Ok(())
    }

    /// Rotate "next" into place and signal resume to moved-on watchers.
    ///
    /// After the rename, any watcher attaching sees the new generation;
    /// the resume stamp in the old inode tells watchers holding it that
    /// the cycle concluded.
    pub fn rotate(&self) -> Result<(), StoreError> {
        let old = self.open_generation(&self.current, false)?;
        std::fs::rename(&self.next, &self.current)?;
        (&old).write_all(RESUME_STAMP)?;
        debug!("rotated watch generation");
        Ok(())
    }

    /// Identity of the current generation file.
    pub fn identity(&self) -> Result<GenerationId, StoreError> {
        let metadata = std::fs::metadata(&self.current).map_err(|source| StoreError::Open {
            path: self.current.clone(),
            source,
        })?;
        Ok(GenerationId {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    fn open_generation(&self, path: &PathBuf, truncate: bool) -> Result<File, StoreError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .mode(GENERATION_FILE_MODE)
            .open(path)
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })
    }
}
