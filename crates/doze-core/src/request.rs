//! The requester protocol.
//!
//! A suspend request is the existence of a marker file; the coordinator
//! deletes it exactly once when the attempt concludes, whether it suspended
//! or was vetoed. The requester cannot observe which directly - it compares
//! the identity of the current watch generation before and after: a
//! concluded attempt that actually suspended has rotated the generation,
//! a vetoed one has not.
//!
//! An immediate request additionally holds an exclusive lock on its own
//! marker; the coordinator treats an unlocked immediate marker as abandoned
//! by a dead requester and reclaims it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::PathBuf;

use fs2::FileExt;
use nix::sys::inotify::AddWatchFlags;
use thiserror::Error;
use tracing::debug;

use crate::config::ControlPaths;
use crate::generation::{GenerationStore, StoreError};
use crate::notify::{self, NotifyError};

/// Mode for marker files.
const MARKER_FILE_MODE: u32 = 0o640;

/// Errors from the requester protocol.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Marker creation or stat failed.
    #[error("request marker operation failed: {0}")]
    Io(#[from] io::Error),

    /// The generation store is unreadable; usually the coordinator is not
    /// running.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Directory notification could not be established.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The notification stream ended before the request concluded.
    #[error("directory notifications stopped")]
    NotificationsClosed,

    /// Another process already holds an immediate request.
    #[error("an immediate request is already pending")]
    ImmediateBusy,
}

/// How a suspend request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// The machine suspended (and has resumed).
    Suspended,
    /// An inhibitor vetoed the attempt; the request was consumed.
    Blocked,
}

/// Request a suspend and wait for the attempt to conclude.
///
/// Returns once the coordinator has deleted the request marker.
pub async fn request_suspend(paths: &ControlPaths) -> Result<SuspendOutcome, RequestError> {
    let store = GenerationStore::new(paths);
    let before = store.identity()?;

    // Watch for the deletion before creating the marker so a fast
    // coordinator cannot conclude the attempt unobserved.
    let mut events = notify::watch_dir(
        paths.run_dir(),
        AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM,
    )?;

    let marker = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(MARKER_FILE_MODE)
        .open(paths.request_marker())?;
    debug!(marker = %paths.request_marker().display(), "suspend requested");

    loop {
        if marker.metadata()?.nlink() == 0 {
            // Attempt concluded; did the generation rotate?
            let after = store.identity()?;
            let outcome = if after == before {
                SuspendOutcome::Blocked
            } else {
                SuspendOutcome::Suspended
            };
            debug!(?outcome, "suspend request concluded");
            return Ok(outcome);
        }
        if events.recv().await.is_none() {
            return Err(RequestError::NotificationsClosed);
        }
    }
}

/// An immediate-suspend request, valid while this handle lives.
///
/// The marker's exclusive lock is the liveness witness: if the requesting
/// process dies, the lock vanishes and the coordinator reclaims the marker.
#[derive(Debug)]
pub struct ImmediateRequest {
    _marker: File,
    path: PathBuf,
}

impl ImmediateRequest {
    /// Create the immediate marker and take its exclusive lock.
    pub fn create(paths: &ControlPaths) -> Result<Self, RequestError> {
        let path = paths.immediate_marker();
        let marker = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(MARKER_FILE_MODE)
            .open(&path)?;
        match marker.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(RequestError::ImmediateBusy);
            }
            Err(e) => return Err(e.into()),
        }
        debug!(marker = %path.display(), "immediate suspend requested");
        Ok(Self {
            _marker: marker,
            path,
        })
    }

    /// Withdraw the request, removing the marker.
    pub fn release(self) -> Result<(), RequestError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;

    const TICK: Duration = Duration::from_secs(5);

    fn setup() -> (TempDir, ControlPaths, GenerationStore) {
        let tmp = TempDir::new().unwrap();
        let paths = ControlPaths::new(tmp.path());
        let store = GenerationStore::new(&paths);
        store.init().unwrap();
        (tmp, paths, store)
    }

    #[tokio::test]
    async fn test_rotation_before_deletion_reads_as_suspended() {
        let (_tmp, paths, store) = setup();
        let request = tokio::spawn({
            let paths = paths.clone();
            async move { request_suspend(&paths).await }
        });

        // Wait for the marker, then conclude the attempt the way the
        // coordinator does after a real suspend: rotate, then delete.
        let marker = paths.request_marker();
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.announce().unwrap();
        store.rotate().unwrap();
        std::fs::remove_file(&marker).unwrap();

        let outcome = timeout(TICK, request).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, SuspendOutcome::Suspended);
    }

    #[tokio::test]
    async fn test_deletion_without_rotation_reads_as_blocked() {
        let (_tmp, paths, _store) = setup();
        let request = tokio::spawn({
            let paths = paths.clone();
            async move { request_suspend(&paths).await }
        });

        let marker = paths.request_marker();
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::remove_file(&marker).unwrap();

        let outcome = timeout(TICK, request).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, SuspendOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_immediate_request_is_exclusive() {
        let (_tmp, paths, _store) = setup();
        let first = ImmediateRequest::create(&paths).unwrap();
        assert!(matches!(
            ImmediateRequest::create(&paths),
            Err(RequestError::ImmediateBusy)
        ));
        first.release().unwrap();
        assert!(!paths.immediate_marker().exists());

        let second = ImmediateRequest::create(&paths).unwrap();
        drop(second);
    }
}
