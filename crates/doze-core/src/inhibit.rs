//! The inhibitor lock protocol.
//!
//! One well-known lock file carries the whole veto protocol: any number of
//! processes hold it shared ("do not suspend while I hold this"), and the
//! coordinator needs it exclusive-and-uncontended to proceed. No process
//! observes acquire/release directly; the only observability is the
//! coordinator's non-blocking exclusive probe.
//!
//! Two sides of the same file:
//!
//! - [`Inhibitor`]: the holder side. `block` takes the shared lock and may
//!   block while the coordinator holds the lock exclusively - which happens
//!   only instantaneously during an actual transition.
//! - [`InhibitGate`]: the coordinator side. `probe` answers "is anyone
//!   inhibiting right now" without holding anything; `try_acquire` takes
//!   the exclusive lock for the commit window.
//!
//! [`AbortSeq`] is the companion abort counter: a monotonic integer in its
//! own control file, bumped under an exclusive lock by any process that
//! wants an in-flight suspend attempt abandoned. The coordinator samples it
//! before notifying watchers and re-validates before committing.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

use crate::config::ControlPaths;

/// Mode for control files under the run directory.
const CONTROL_FILE_MODE: u32 = 0o640;

/// Errors from the inhibitor-lock protocol.
#[derive(Debug, Error)]
pub enum LockError {
    /// A control file could not be opened or created.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Path of the control file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A lock operation or counter update failed.
    #[error("lock operation failed: {0}")]
    Io(#[from] io::Error),
}

/// Open a control file read-write, creating it with the control mode.
fn open_control_file(path: &Path) -> Result<File, LockError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(CONTROL_FILE_MODE)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_owned(),
            source,
        })
}

/// Returns `true` if `err` means the lock is held by someone else.
fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Holder side of the inhibitor lock.
///
/// The descriptor stays open across `block`/`allow` cycles so repeated
/// inhibits never re-pay the open.
#[derive(Debug)]
pub struct Inhibitor {
    file: File,
    held: bool,
}

impl Inhibitor {
    /// Open the inhibitor lock file without taking the lock.
    pub fn open(paths: &ControlPaths) -> Result<Self, LockError> {
        let file = open_control_file(&paths.disabled())?;
        Ok(Self { file, held: false })
    }

    /// Take the shared lock. Idempotent.
    ///
    /// May block while the coordinator holds the lock exclusively; that
    /// window lasts only as long as the actual transition write.
    pub fn block(&mut self) -> Result<(), LockError> {
        if !self.held {
            self.file.lock_shared()?;
            self.held = true;
            debug!("inhibitor lock taken");
        }
        Ok(())
    }

    /// Drop the shared lock, keeping the descriptor open. Idempotent.
    pub fn allow(&mut self) -> Result<(), LockError> {
        if self.held {
            FileExt::unlock(&self.file)?;
            self.held = false;
            debug!("inhibitor lock released");
        }
        Ok(())
    }

    /// Whether this handle currently holds the shared lock.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.held
    }
}

/// Coordinator side of the inhibitor lock.
#[derive(Debug)]
pub struct InhibitGate {
    file: File,
}

impl InhibitGate {
    /// Open the gate over the inhibitor lock file.
    pub fn open(paths: &ControlPaths) -> Result<Self, LockError> {
        let file = open_control_file(&paths.disabled())?;
        Ok(Self { file })
    }

    /// Non-blocking exclusive probe: `true` if no inhibitor holds the lock.
    ///
    /// The exclusive lock is dropped again immediately; this only answers
    /// the question, it reserves nothing.
    pub fn probe(&self) -> Result<bool, LockError> {
        match self.file.try_lock_exclusive() {
            Ok(()) => {
                FileExt::unlock(&self.file)?;
                Ok(true)
            }
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking exclusive acquisition, held on success.
    pub fn try_acquire(&self) -> Result<bool, LockError> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking exclusive acquisition (waits out every inhibitor).
    pub fn acquire(&self) -> Result<(), LockError> {
        self.file.lock_exclusive()?;
        Ok(())
    }

    /// Release a held exclusive lock.
    pub fn release(&self) -> Result<(), LockError> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}

/// The monotonic abort counter.
///
/// Replaces the original access-timestamp comparison with an explicit
/// counter: same "nothing changed across the notification round"
/// guarantee, independent of filesystem timestamp resolution.
#[derive(Debug)]
pub struct AbortSeq;

impl AbortSeq {
    /// Read the current counter value.
    ///
    /// A missing or unparseable counter reads as zero.
    pub fn read(paths: &ControlPaths) -> Result<u64, LockError> {
        let mut file = open_control_file(&paths.abort_seq())?;
        file.lock_shared()?;
        let value = Self::read_value(&mut file);
        FileExt::unlock(&file)?;
        Ok(value?)
    }

    /// Increment the counter, invalidating any in-flight suspend attempt.
    ///
    /// Returns the new value.
    pub fn bump(paths: &ControlPaths) -> Result<u64, LockError> {
        let mut file = open_control_file(&paths.abort_seq())?;
        file.lock_exclusive()?;
        let result = Self::bump_locked(&mut file);
        FileExt::unlock(&file)?;
        let value = result?;
        debug!(abort_seq = value, "abort counter bumped");
        Ok(value)
    }

    fn read_value(file: &mut File) -> Result<u64, LockError> {
        let mut buf = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut buf)?;
        // A corrupt counter resets to zero; the next bump repairs it.
        Ok(buf.trim().parse().unwrap_or(0))
    }

    fn bump_locked(file: &mut File) -> Result<u64, LockError> {
        let next = Self::read_value(file)?.wrapping_add(1);
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{next}")?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_paths() -> (TempDir, ControlPaths) {
        let tmp = TempDir::new().unwrap();
        let paths = ControlPaths::new(tmp.path());
        (tmp, paths)
    }

    #[test]
    fn test_block_and_allow_are_idempotent() {
        let (_tmp, paths) = test_paths();
        let mut inhibitor = Inhibitor::open(&paths).unwrap();

        assert!(!inhibitor.is_blocking());
        inhibitor.block().unwrap();
        inhibitor.block().unwrap();
        assert!(inhibitor.is_blocking());
        inhibitor.allow().unwrap();
        inhibitor.allow().unwrap();
        assert!(!inhibitor.is_blocking());
    }

    #[test]
    fn test_probe_sees_shared_holder() {
        let (_tmp, paths) = test_paths();
        let mut inhibitor = Inhibitor::open(&paths).unwrap();
        let gate = InhibitGate::open(&paths).unwrap();

        assert!(gate.probe().unwrap(), "uncontended probe should succeed");

        inhibitor.block().unwrap();
        assert!(!gate.probe().unwrap(), "probe must fail while inhibited");

        inhibitor.allow().unwrap();
        assert!(gate.probe().unwrap());
    }

    #[test]
    fn test_probe_fails_until_every_inhibitor_releases() {
        let (_tmp, paths) = test_paths();
        let gate = InhibitGate::open(&paths).unwrap();
        let mut first = Inhibitor::open(&paths).unwrap();
        let mut second = Inhibitor::open(&paths).unwrap();

        first.block().unwrap();
        second.block().unwrap();
        assert!(!gate.probe().unwrap());

        first.allow().unwrap();
        assert!(!gate.probe().unwrap(), "one holder is enough to inhibit");

        second.allow().unwrap();
        assert!(gate.probe().unwrap());
    }

    #[test]
    fn test_try_acquire_holds_the_lock() {
        let (_tmp, paths) = test_paths();
        let gate = InhibitGate::open(&paths).unwrap();
        let mut inhibitor = Inhibitor::open(&paths).unwrap();

        assert!(gate.try_acquire().unwrap());
        // A second descriptor cannot get the shared lock now.
        let contended = inhibitor.file.try_lock_shared();
        assert!(contended.is_err());
        gate.release().unwrap();
        inhibitor.block().unwrap();
    }

    #[test]
    fn test_abort_seq_bumps_monotonically() {
        let (_tmp, paths) = test_paths();
        assert_eq!(AbortSeq::read(&paths).unwrap(), 0);
        assert_eq!(AbortSeq::bump(&paths).unwrap(), 1);
        assert_eq!(AbortSeq::bump(&paths).unwrap(), 2);
        assert_eq!(AbortSeq::read(&paths).unwrap(), 2);
    }

    #[test]
    fn test_abort_seq_corrupt_value_reads_zero() {
        let (_tmp, paths) = test_paths();
        std::fs::write(paths.abort_seq(), b"not a number").unwrap();
        assert_eq!(AbortSeq::read(&paths).unwrap(), 0);
        assert_eq!(AbortSeq::bump(&paths).unwrap(), 1);
    }
}
