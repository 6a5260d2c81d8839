//! Run-directory layout and control-file paths.
//!
//! Every cross-process resource doze uses lives under one run directory
//! (default `/run/suspend`): the inhibitor lock file, the request markers,
//! the generation pair, the abort counter and both service sockets.
//! [`ControlPaths`] derives each path from the configured root so daemons,
//! clients and tests agree on the layout while tests point it at a
//! tempdir.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default run directory for the control surface.
pub const DEFAULT_RUN_DIR: &str = "/run/suspend";

/// Inhibitor lock file (shared = inhibiting, exclusive = coordinator owns).
const DISABLED_FILE: &str = "disabled";
/// Pending suspend request marker.
const REQUEST_FILE: &str = "request";
/// "Suspend now" marker, valid while its creator holds it locked.
const IMMEDIATE_FILE: &str = "immediate";
/// Current watch generation.
const WATCHING_FILE: &str = "watching";
/// Next watch generation, rotated into place by the coordinator.
const WATCHING_NEXT_FILE: &str = "watching-next";
/// Monotonic abort counter.
const ABORT_SEQ_FILE: &str = "abort-seq";
/// Fd-registration socket of the veto service.
const REGISTRATION_SOCKET: &str = "registration";
/// Socket of the wake-alarm service.
const WAKEALARM_SOCKET: &str = "wakealarm";

/// Mode for the run directory (owner + group).
const RUN_DIR_MODE: u32 = 0o770;

/// Control-surface paths, all derived from one run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPaths {
    /// Root of the control surface.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

fn default_run_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUN_DIR)
}

impl Default for ControlPaths {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
        }
    }
}

impl ControlPaths {
    /// Control paths rooted at `run_dir`.
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// The run directory itself.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Create the run directory if needed.
    ///
    /// The mode is only enforced on a directory this call creates; an
    /// existing directory keeps whatever permissions the administrator
    /// gave it.
    pub fn ensure_run_dir(&self) -> io::Result<()> {
        match std::fs::symlink_metadata(&self.run_dir) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists but is not a directory", self.run_dir.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.run_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(RUN_DIR_MODE);
                    std::fs::set_permissions(&self.run_dir, perms)?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Inhibitor lock file.
    #[must_use]
    pub fn disabled(&self) -> PathBuf {
        self.run_dir.join(DISABLED_FILE)
    }

    /// Suspend request marker.
    #[must_use]
    pub fn request_marker(&self) -> PathBuf {
        self.run_dir.join(REQUEST_FILE)
    }

    /// Immediate-suspend marker.
    #[must_use]
    pub fn immediate_marker(&self) -> PathBuf {
        self.run_dir.join(IMMEDIATE_FILE)
    }

    /// Current watch generation file.
    #[must_use]
    pub fn watching(&self) -> PathBuf {
        self.run_dir.join(WATCHING_FILE)
    }

    /// Next watch generation file.
    #[must_use]
    pub fn watching_next(&self) -> PathBuf {
        self.run_dir.join(WATCHING_NEXT_FILE)
    }

    /// Abort counter file.
    #[must_use]
    pub fn abort_seq(&self) -> PathBuf {
        self.run_dir.join(ABORT_SEQ_FILE)
    }

    /// Veto-service registration socket.
    #[must_use]
    pub fn registration_socket(&self) -> PathBuf {
        self.run_dir.join(REGISTRATION_SOCKET)
    }

    /// Wake-alarm service socket.
    #[must_use]
    pub fn wakealarm_socket(&self) -> PathBuf {
        self.run_dir.join(WAKEALARM_SOCKET)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_default_paths() {
        let paths = ControlPaths::default();
        assert_eq!(paths.disabled(), Path::new("/run/suspend/disabled"));
        assert_eq!(paths.request_marker(), Path::new("/run/suspend/request"));
        assert_eq!(paths.watching(), Path::new("/run/suspend/watching"));
        assert_eq!(
            paths.watching_next(),
            Path::new("/run/suspend/watching-next")
        );
        assert_eq!(
            paths.registration_socket(),
            Path::new("/run/suspend/registration")
        );
        assert_eq!(paths.wakealarm_socket(), Path::new("/run/suspend/wakealarm"));
    }

    #[test]
    fn test_ensure_run_dir_creates() {
        let tmp = TempDir::new().unwrap();
        let paths = ControlPaths::new(tmp.path().join("suspend"));
        paths.ensure_run_dir().unwrap();
        assert!(paths.run_dir().is_dir());
        // Second call is a no-op.
        paths.ensure_run_dir().unwrap();
    }

    #[test]
    fn test_ensure_run_dir_rejects_file() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("suspend");
        std::fs::write(&target, b"not a dir").unwrap();
        let paths = ControlPaths::new(&target);
        assert!(paths.ensure_run_dir().is_err());
    }
}
