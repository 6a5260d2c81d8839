//! Listener binding for the service sockets.
//!
//! Both services bind a Unix socket inside the run directory. A stale
//! socket file from a previous instance is removed before binding; a path
//! occupied by anything that is not a socket is refused rather than
//! clobbered.

use std::io;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{debug, info};

/// Socket permissions (owner + group).
const SOCKET_MODE: u32 = 0o660;

/// Bind a service socket, replacing a stale one.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    cleanup_stale(path)?;

    let listener = UnixListener::bind(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to bind socket {}: {e}", path.display()),
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(SOCKET_MODE);
        std::fs::set_permissions(path, perms)?;
    }

    info!(socket = %path.display(), "listening");
    Ok(listener)
}

fn cleanup_stale(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
        Ok(metadata) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists but is not a socket", path.display()),
                    ));
                }
            }
            let _ = metadata;
        }
    }
    std::fs::remove_file(path)?;
    debug!(socket = %path.display(), "removed stale socket file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_bind_sets_mode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("svc.sock");
        let _listener = bind_socket(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE, "socket mode should be 0660, got {mode:04o}");
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("svc.sock");

        let first = bind_socket(&path).unwrap();
        drop(first);
        assert!(path.exists(), "socket file survives a dropped listener");

        let _second = bind_socket(&path).unwrap();
    }

    #[tokio::test]
    async fn test_non_socket_path_is_refused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("svc.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = bind_socket(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(path.exists(), "existing non-socket file must be left alone");
    }
}
