//! Watcher half of the suspend/resume broadcast.
//!
//! A [`SuspendWatcher`] attaches to the current watch generation by taking
//! a shared lock on it, then turns directory notifications into a stream of
//! [`SuspendEvent`]s. On "suspend imminent" it first shared-locks the next
//! generation (holding its place in the following cycle) and only reports
//! the event; releasing the old generation - the acknowledgment the
//! coordinator waits for - happens when the owner calls
//! [`SuspendWatcher::acknowledge`]. Owners that need to finish work first
//! simply delay that call.
//!
//! Generation-file sizes carry the signal: size >= 1 on the held generation
//! means suspend was announced, size >= 2 on a generation the watcher has
//! moved past means the cycle concluded. Anything else is a false alarm
//! from unrelated activity in the run directory.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use fs2::FileExt;
use nix::sys::inotify::AddWatchFlags;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ControlPaths;
use crate::generation::RESUME_STAMP;
use crate::notify::{self, DirEvents, NotifyError};

/// Errors from the watcher protocol.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The generation file could not be opened; usually the coordinator is
    /// not running.
    #[error("failed to attach to {path}: {source}")]
    Attach {
        /// The generation file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Directory notification could not be established.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The notification stream ended (watch thread died).
    #[error("directory notifications stopped")]
    NotificationsClosed,

    /// Lock or stat operation failed.
    #[error("watch operation failed: {0}")]
    Io(#[from] io::Error),
}

/// One edge of the suspend cycle, as seen by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendEvent {
    /// Suspend is imminent; finish pending work, then
    /// [`acknowledge`](SuspendWatcher::acknowledge).
    Suspending,
    /// The cycle concluded (the machine resumed, or the attempt was
    /// abandoned); the watcher is attached to the new generation.
    Resumed,
}

/// A registered suspend observer.
///
/// Dropping the watcher releases every lock it holds, which a pending
/// rotation treats as acknowledgment.
#[derive(Debug)]
pub struct SuspendWatcher {
    paths: ControlPaths,
    events: DirEvents,
    /// Generation this watcher is attached to.
    current: File,
    /// Next generation, held from the moment suspend is announced.
    next: Option<File>,
    /// Shared lock on `current` has been released this cycle.
    acked: bool,
}

impl SuspendWatcher {
    /// Attach to the current watch generation.
    ///
    /// If a rotation is already in progress the watcher still joins the
    /// pre-rotation generation; the first call to
    /// [`next_event`](Self::next_event) reports the in-flight cycle
    /// without waiting for another notification.
    pub async fn attach(paths: &ControlPaths) -> Result<Self, WatchError> {
        // Watch before locking so no rotation edge can slip between.
        let events = notify::watch_dir(
            paths.run_dir(),
            AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_MOVED_TO,
        )?;

        let current = Self::open_generation(paths.watching())?;
        // Taking the shared lock can wait out a rotation in progress.
        let current = tokio::task::spawn_blocking(move || -> io::Result<File> {
            current.lock_shared()?;
            Ok(current)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))??;

        debug!(run_dir = %paths.run_dir().display(), "attached suspend watcher");
        Ok(Self {
            paths: paths.clone(),
            events,
            current,
            next: None,
            acked: false,
        })
    }

    /// Wait for the next suspend-cycle edge.
    ///
    /// Cancel safe: the only await point is the notification channel; all
    /// state transitions happen synchronously before returning.
    pub async fn next_event(&mut self) -> Result<SuspendEvent, WatchError> {
        loop {
            if let Some(event) = self.check_transition()? {
                return Ok(event);
            }
            if self.events.recv().await.is_none() {
                return Err(WatchError::NotificationsClosed);
            }
        }
    }

    /// Release the shared lock on the announced generation.
    ///
    /// This is the readiness acknowledgment the coordinator's rotation
    /// waits for. Harmless when no acknowledgment is pending.
    pub fn acknowledge(&mut self) -> Result<(), WatchError> {
        if self.next.is_some() && !self.acked {
            FileExt::unlock(&self.current)?;
            self.acked = true;
            trace!("acknowledged suspend");
        }
        Ok(())
    }

    /// Detach, releasing all held locks.
    pub fn detach(self) {
        drop(self);
    }

    fn check_transition(&mut self) -> Result<Option<SuspendEvent>, WatchError> {
        if let Some(next) = self.next.take() {
            // Moved on; the old inode gains the resume stamp when the
            // coordinator rotates.
            let len = self.current.metadata()?.len();
            if len >= RESUME_STAMP.len() as u64 {
                self.current = next;
                self.acked = false;
                debug!("suspend cycle concluded");
                return Ok(Some(SuspendEvent::Resumed));
            }
            self.next = Some(next);
            return Ok(None);
        }

        let len = self.current.metadata()?.len();
        if len == 0 {
            // Unrelated run-directory activity.
            return Ok(None);
        }

        // Suspend announced: hold a place in the following cycle before
        // reporting. This lock only contends with a rotation that cannot
        // start until we acknowledge, so it never blocks meaningfully.
        let next = Self::open_generation(self.paths.watching_next())?;
        next.lock_shared()?;
        self.next = Some(next);
        debug!("suspend imminent");
        Ok(Some(SuspendEvent::Suspending))
    }

    fn open_generation(path: PathBuf) -> Result<File, WatchError> {
        File::open(&path).map_err(|source| WatchError::Attach { path, source })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use crate::generation::GenerationStore;

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
    async fn test_full_cycle_delivers_both_edges() {
        let (_tmp, paths, store) = setup();
        let mut watcher = SuspendWatcher::attach(&paths).await.unwrap();

        let announce_store = store.clone();
        let announce = tokio::task::spawn_blocking(move || announce_store.announce());

        let event = timeout(TICK, watcher.next_event())
            .await
            .expect("no suspend event")
            .unwrap();
        assert_eq!(event, SuspendEvent::Suspending);

        watcher.acknowledge().unwrap();
        timeout(TICK, announce)
            .await
            .expect("announce did not complete after acknowledgment")
            .unwrap()
            .unwrap();

        store.rotate().unwrap();
        let event = timeout(TICK, watcher.next_event())
            .await
            .expect("no resume event")
            .unwrap();
        assert_eq!(event, SuspendEvent::Resumed);
    }

    #[tokio::test]
    async fn test_announce_blocks_until_acknowledged() {
        let (_tmp, paths, store) = setup();
        let mut watcher = SuspendWatcher::attach(&paths).await.unwrap();

        let announce_store = store.clone();
        let mut announce = tokio::task::spawn_blocking(move || announce_store.announce());

        assert_eq!(
            timeout(TICK, watcher.next_event()).await.unwrap().unwrap(),
            SuspendEvent::Suspending
        );

        // Without acknowledgment the rotation must not complete.
        assert!(
            timeout(Duration::from_millis(300), &mut announce).await.is_err(),
            "announce completed without acknowledgment"
        );

        watcher.acknowledge().unwrap();
        timeout(TICK, announce).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_attach_mid_rotation_joins_inflight_cycle() {
        let (_tmp, paths, store) = setup();

        // Announce with no watchers attached: completes immediately and
        // leaves the suspend stamp in place.
        store.announce().unwrap();

        // Attaching now must surface the in-flight cycle at once.
        let mut watcher = SuspendWatcher::attach(&paths).await.unwrap();
        let event = timeout(TICK, watcher.next_event())
            .await
            .expect("in-flight cycle not reported")
            .unwrap();
        assert_eq!(event, SuspendEvent::Suspending);

        watcher.acknowledge().unwrap();
        store.rotate().unwrap();
        assert_eq!(
            timeout(TICK, watcher.next_event()).await.unwrap().unwrap(),
            SuspendEvent::Resumed
        );
    }

    #[tokio::test]
    async fn test_unrelated_activity_is_filtered() {
        let (tmp, paths, store) = setup();
        let mut watcher = SuspendWatcher::attach(&paths).await.unwrap();

        // Unrelated file churn in the run directory.
        std::fs::write(tmp.path().join("request"), b"x").unwrap();

        assert!(
            timeout(Duration::from_millis(300), watcher.next_event())
                .await
                .is_err(),
            "false alarm surfaced as an event"
        );
        drop(store);
    }

    #[tokio::test]
    async fn test_drop_counts_as_acknowledgment() {
        let (_tmp, paths, store) = setup();
        let watcher = SuspendWatcher::attach(&paths).await.unwrap();

        let announce_store = store.clone();
        let announce = tokio::task::spawn_blocking(move || announce_store.announce());

        // Give the announce a moment to reach the exclusive-lock wait,
        // then detach without acknowledging.
        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.detach();

        timeout(TICK, announce)
            .await
            .expect("announce did not complete after detach")
            .unwrap()
            .unwrap();
    }
}
