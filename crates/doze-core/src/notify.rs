//! Directory-change notification.
//!
//! A dedicated thread owns an inotify descriptor and forwards every event
//! on the watched directory into an unbounded channel. Async consumers
//! `recv().await`; the synchronous coordinator uses `blocking_recv`. The
//! thread exits when the receiving side goes away.

use std::ffi::OsString;
use std::io;
use std::path::Path;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors establishing a directory watch.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The inotify descriptor or watch could not be set up.
    #[error("failed to watch {path}: {source}")]
    Watch {
        /// The directory that could not be watched.
        path: std::path::PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

/// One observed change in the watched directory.
#[derive(Debug, Clone)]
pub struct DirEvent {
    /// Name of the affected entry, when the kernel reported one.
    pub name: Option<OsString>,
}

/// Receiving side of a directory watch.
#[derive(Debug)]
pub struct DirEvents {
    rx: mpsc::UnboundedReceiver<DirEvent>,
}

impl DirEvents {
    /// Wait for the next event.
    ///
    /// Returns `None` if the watch thread died (inotify read failure).
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<DirEvent> {
        self.rx.recv().await
    }

    /// Blocking variant for synchronous loops.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<DirEvent> {
        self.rx.blocking_recv()
    }
}

/// Watch a directory for changes.
///
/// `mask` selects the inotify events of interest; queue overflow is
/// forwarded as an anonymous event so consumers re-scan rather than miss a
/// change.
pub fn watch_dir(path: &Path, mask: AddWatchFlags) -> Result<DirEvents, NotifyError> {
    let inotify = Inotify::init(InitFlags::IN_CLOEXEC).map_err(|errno| NotifyError::Watch {
        path: path.to_owned(),
        source: io::Error::from_raw_os_error(errno as i32),
    })?;
    inotify
        .add_watch(path, mask)
        .map_err(|errno| NotifyError::Watch {
            path: path.to_owned(),
            source: io::Error::from_raw_os_error(errno as i32),
        })?;

    let (tx, rx) = mpsc::unbounded_channel();
    let watched = path.to_owned();

    std::thread::Builder::new()
        .name("doze-dirwatch".into())
        .spawn(move || {
            loop {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(errno) => {
                        warn!(path = %watched.display(), error = %errno, "inotify read failed");
                        break;
                    }
                };
                for event in events {
                    if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        debug!(path = %watched.display(), "inotify queue overflow");
                    }
                    if tx.send(DirEvent { name: event.name }).is_err() {
                        // Receiver is gone; nothing left to notify.
                        return;
                    }
                }
            }
        })
        .map_err(|source| NotifyError::Watch {
            path: path.to_owned(),
            source,
        })?;

    Ok(DirEvents { rx })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_create_event_is_delivered() {
        let tmp = TempDir::new().unwrap();
        let mut events = watch_dir(tmp.path(), AddWatchFlags::IN_CREATE).unwrap();

        std::fs::write(tmp.path().join("marker"), b"").unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event not delivered")
            .expect("watch thread died");
        assert_eq!(event.name.as_deref(), Some("marker".as_ref()));
    }

    #[tokio::test]
    async fn test_modify_event_is_delivered() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("watching");
        std::fs::write(&target, b"").unwrap();

        let mut events = watch_dir(tmp.path(), AddWatchFlags::IN_MODIFY).unwrap();
        std::fs::write(&target, b"\0").unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event not delivered")
            .expect("watch thread died");
        assert_eq!(event.name.as_deref(), Some("watching".as_ref()));
    }

    #[test]
    fn test_watch_missing_directory_fails() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("gone");
        assert!(watch_dir(&missing, AddWatchFlags::IN_CREATE).is_err());
    }
}
