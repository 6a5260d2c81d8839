//! SCM_RIGHTS helpers for the veto registration protocol.
//!
//! The veto service receives the descriptors it monitors over its
//! registration socket; these helpers wrap the `sendmsg`/`recvmsg`
//! ancillary-data plumbing for both sides. Sockets are expected to be in
//! non-blocking mode; `WouldBlock` surfaces unchanged so async callers can
//! retry on readiness.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Upper bound on descriptors accepted in one registration message.
pub const MAX_PASSED_FDS: usize = 16;

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Send `data` with `fds` attached as SCM_RIGHTS ancillary data.
pub fn send_with_fds(socket: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    sendmsg::<()>(socket, &iov, &cmsgs, MsgFlags::empty(), None).map_err(errno_to_io)
}

/// Receive into `buf`, collecting any descriptors passed alongside.
///
/// Received descriptors are opened close-on-exec and returned owned; a
/// zero-byte read means the peer closed the connection.
pub fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg::<()>(
        socket,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(errno_to_io)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(errno_to_io)? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            for fd in raw {
                // SAFETY: the kernel just handed us these descriptors; we
                // are their sole owner.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Ok((msg.bytes, fds))
}
