//! Kernel power interfaces.
//!
//! Three small sysfs surfaces, each isolated behind a type so the
//! coordinator and alarm service can be tested against plain files:
//!
//! - [`PowerInterface`]: the wakeup-count race check. The count is read
//!   before watchers are notified and written back unchanged just before
//!   the transition; the kernel refuses the write if a wakeup event
//!   happened in between.
//! - [`SleepBackend`]: the transition itself, a single `mem` write.
//! - [`RtcWakeAlarm`]: programming the wake hardware.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

/// The sleep-state string written to enter suspend-to-RAM.
const MEM_STATE: &[u8] = b"mem\n";

/// The wakeup-count interface.
#[derive(Debug, Clone)]
pub struct PowerInterface {
    wakeup_count: PathBuf,
}

impl PowerInterface {
    /// Interface over the given wakeup-count path.
    #[must_use]
    pub const fn new(wakeup_count: PathBuf) -> Self {
        Self { wakeup_count }
    }

    /// Capture the current wakeup count.
    ///
    /// `None` when the interface is unavailable; the caller then skips the
    /// race check and suspends regardless, matching the kernel-less case.
    #[must_use]
    pub fn read_wakeup_count(&self) -> Option<u64> {
        match std::fs::read_to_string(&self.wakeup_count) {
            Ok(raw) => match raw.trim().parse() {
                Ok(count) => Some(count),
                Err(_) => {
                    warn!(raw = raw.trim(), "unparseable wakeup count");
                    None
                }
            },
            Err(e) => {
                debug!(error = %e, "wakeup count unavailable");
                None
            }
        }
    }

    /// Write the captured count back; `false` means a wakeup event raced
    /// the suspend attempt and the cycle must be skipped.
    #[must_use]
    pub fn commit_wakeup_count(&self, count: u64) -> bool {
        let result = OpenOptions::new()
            .write(true)
            .open(&self.wakeup_count)
            .and_then(|mut f| f.write_all(count.to_string().as_bytes()));
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(count, error = %e, "wakeup count rejected, a wakeup raced us");
                false
            }
        }
    }
}

/// The power-state transition, one privileged write.
pub trait SleepBackend {
    /// Enter suspend. Returns when the machine resumes.
    fn enter(&self) -> io::Result<()>;
}

/// The real sysfs transition.
#[derive(Debug, Clone)]
pub struct SysfsSleep {
    state: PathBuf,
}

impl SysfsSleep {
    /// Backend writing to the given sleep-state path.
    #[must_use]
    pub const fn new(state: PathBuf) -> Self {
        Self { state }
    }
}

impl SleepBackend for SysfsSleep {
    fn enter(&self) -> io::Result<()> {
        let mut f = OpenOptions::new().write(true).open(&self.state)?;
        f.write_all(MEM_STATE)
    }
}

/// The RTC wake-alarm interface.
#[derive(Debug, Clone)]
pub struct RtcWakeAlarm {
    path: PathBuf,
}

impl RtcWakeAlarm {
    /// Interface over the given RTC wake-alarm path.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Program the hardware to wake at `epoch` seconds.
    ///
    /// A pending alarm must be cleared with `0` before a new value is
    /// accepted.
    pub fn program(&self, epoch: i64) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        f.write_all(b"0\n")?;
        f.write_all(format!("{epoch}\n").as_bytes())?;
        debug!(epoch, "programmed RTC wake alarm");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_wakeup_count_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wakeup_count");
        std::fs::write(&path, "42\n").unwrap();

        let power = PowerInterface::new(path.clone());
        assert_eq!(power.read_wakeup_count(), Some(42));
        assert!(power.commit_wakeup_count(42));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "42");
    }

    #[test]
    fn test_missing_interface_reads_none() {
        let tmp = TempDir::new().unwrap();
        let power = PowerInterface::new(tmp.path().join("absent"));
        assert_eq!(power.read_wakeup_count(), None);
    }

    #[test]
    fn test_unwritable_interface_fails_commit() {
        let tmp = TempDir::new().unwrap();
        // A directory can be read-failed and write-failed alike.
        let power = PowerInterface::new(tmp.path().to_path_buf());
        assert!(!power.commit_wakeup_count(1));
    }

    #[test]
    fn test_garbage_count_reads_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wakeup_count");
        std::fs::write(&path, "not a count\n").unwrap();
        let power = PowerInterface::new(path);
        assert_eq!(power.read_wakeup_count(), None);
    }

    #[test]
    fn test_sysfs_sleep_writes_mem() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state");
        std::fs::write(&path, "").unwrap();

        SysfsSleep::new(path.clone()).enter().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"mem\n");
    }

    #[test]
    fn test_rtc_program_clears_then_sets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wakealarm");

        RtcWakeAlarm::new(path.clone()).program(1_700_000_000).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0\n1700000000\n");
    }
}
