//! The suspend coordinator's decision loop.
//!
//! One synchronous loop per machine decides exactly when it is safe to
//! sleep. Each cycle:
//!
//! 1. delete any stale request marker, then wait (directory notification)
//!    for a request or immediate marker to appear
//! 2. probe the inhibitor lock; if contended, wait the inhibitors out,
//!    consume the request and report it blocked - an inhibited request is
//!    consumed, never silently retried with stale data
//! 3. capture the kernel wakeup count and the abort counter
//! 4. announce suspend through the generation store and wait for every
//!    watcher's acknowledgment (unbounded by design)
//! 5. re-acquire the inhibitor lock exclusively, re-validate the request,
//!    the abort counter and the wakeup count, and perform the transition
//! 6. release the lock, rotate the generation store (the resume
//!    broadcast), delete the request marker
//!
//! Startup failures are fatal; everything after that is a recoverable
//! cycle outcome and the loop keeps running.

use std::fs::OpenOptions;
use std::io;
use std::time::Duration;

use doze_core::config::ControlPaths;
use doze_core::generation::{GenerationStore, StoreError};
use doze_core::inhibit::{AbortSeq, InhibitGate, LockError};
use doze_core::notify::{self, DirEvents, NotifyError};
use fs2::FileExt;
use nix::sys::inotify::AddWatchFlags;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::power::{PowerInterface, SleepBackend};

/// Pause after a failed cycle so persistent errors cannot spin the loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Errors from the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Lock-file operation failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Generation-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Directory notification could not be established.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The notification stream ended.
    #[error("directory notifications stopped")]
    NotificationsClosed,

    /// Control-file I/O failed.
    #[error("coordinator I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// How one suspend cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The machine suspended and resumed.
    Suspended,
    /// An inhibitor vetoed the attempt.
    Blocked,
    /// A wakeup event (or failed transition) raced the attempt.
    Raced,
    /// The abort counter changed during notification.
    Aborted,
    /// The request vanished or its requester died during notification.
    Invalid,
}

/// The suspend coordinator.
pub struct Coordinator<S: SleepBackend> {
    paths: ControlPaths,
    store: GenerationStore,
    gate: InhibitGate,
    power: PowerInterface,
    sleep: S,
    events: DirEvents,
}

impl<S: SleepBackend> Coordinator<S> {
    /// Open the control surface and create the initial generation pair.
    ///
    /// Any failure here is fatal: a coordinator that cannot own its
    /// control files must not run.
    pub fn new(
        paths: ControlPaths,
        power: PowerInterface,
        sleep: S,
    ) -> Result<Self, CoordinatorError> {
        paths.ensure_run_dir()?;
        let gate = InhibitGate::open(&paths)?;
        let store = GenerationStore::new(&paths);
        store.init()?;
        let events = notify::watch_dir(
            paths.run_dir(),
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO,
        )?;
        info!(run_dir = %paths.run_dir().display(), "suspend coordinator ready");
        Ok(Self {
            paths,
            store,
            gate,
            power,
            sleep,
            events,
        })
    }

    /// Run the decision loop forever.
    pub fn run(&mut self) -> Result<(), CoordinatorError> {
        loop {
            match self.run_cycle() {
                Ok(outcome) => info!(?outcome, "suspend cycle concluded"),
                Err(
                    e @ (CoordinatorError::Notify(_) | CoordinatorError::NotificationsClosed),
                ) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "suspend cycle failed");
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }

    /// Run one full cycle: wait for a request, then resolve it.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, CoordinatorError> {
        // A marker left over from a satisfied request must not replay.
        self.consume_request();
        self.wait_for_request()?;
        debug!("suspend request observed");

        if !self.gate.probe()? {
            // Wait the inhibitors out, then consume the request: the
            // requester must re-issue rather than have us retry against
            // stale state.
            self.gate.acquire()?;
            self.gate.release()?;
            self.consume_request();
            return Ok(CycleOutcome::Blocked);
        }

        let count = self.power.read_wakeup_count();
        let abort_before = AbortSeq::read(&self.paths)?;

        // The notification round; unbounded by watcher cooperation.
        self.store.announce()?;

        let outcome = if self.gate.try_acquire()? {
            let outcome = self.commit(count, abort_before)?;
            self.gate.release()?;
            outcome
        } else {
            CycleOutcome::Blocked
        };

        // Resume broadcast runs whether or not we actually slept, so
        // watchers always see the cycle conclude.
        self.store.rotate()?;
        self.consume_request();
        Ok(outcome)
    }

    /// Final validation and the transition itself, under the exclusive
    /// inhibitor lock.
    fn commit(
        &self,
        count: Option<u64>,
        abort_before: u64,
    ) -> Result<CycleOutcome, CoordinatorError> {
        if !self.request_still_valid()? {
            return Ok(CycleOutcome::Invalid);
        }
        if AbortSeq::read(&self.paths)? != abort_before {
            debug!("abort counter changed during notification");
            return Ok(CycleOutcome::Aborted);
        }
        if let Some(count) = count {
            if !self.power.commit_wakeup_count(count) {
                return Ok(CycleOutcome::Raced);
            }
        }
        match self.sleep.enter() {
            Ok(()) => Ok(CycleOutcome::Suspended),
            Err(e) => {
                // The kernel refused the transition; skip the cycle.
                warn!(error = %e, "sleep transition rejected");
                Ok(CycleOutcome::Raced)
            }
        }
    }

    fn wait_for_request(&mut self) -> Result<(), CoordinatorError> {
        loop {
            if self.paths.request_marker().exists() || self.paths.immediate_marker().exists() {
                return Ok(());
            }
            if self.events.blocking_recv().is_none() {
                return Err(CoordinatorError::NotificationsClosed);
            }
        }
    }

    /// Re-check the request after the notification round.
    ///
    /// An immediate marker is valid only while its creator holds the
    /// exclusive lock; an unlocked one belongs to a dead requester and is
    /// reclaimed.
    fn request_still_valid(&self) -> Result<bool, CoordinatorError> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.paths.immediate_marker())
        {
            Ok(marker) => match marker.try_lock_exclusive() {
                Ok(()) => {
                    debug!("reclaiming abandoned immediate marker");
                    let _ = std::fs::remove_file(self.paths.immediate_marker());
                    FileExt::unlock(&marker)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(e.into()),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.paths.request_marker().exists())
    }

    fn consume_request(&self) {
        if let Err(e) = std::fs::remove_file(self.paths.request_marker()) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove request marker");
            }
        }
    }
}
