//! Client side of the fd-readiness veto protocol.
//!
//! A process that produces wake events hands the veto service one or more
//! descriptors to monitor. Just before every suspend attempt the service
//! polls them; if one is readable it sends `S` and suspend waits until the
//! owner has drained the descriptor and replied `R`. When a cycle ends
//! without suspending (or after resume), every connection that saw an `S`
//! receives an unsolicited `A`.
//!
//! Wire protocol, one byte per message:
//!
//! | direction | byte | meaning |
//! |---|---|---|
//! | server → client | `A` | greeting / registration ack / cycle over |
//! | client → server | `W` (+ fds) | watch these descriptors |
//! | server → client | `S` | suspend imminent, a descriptor is readable |
//! | client → server | `R` | descriptor drained, ready for suspend |
//!
//! Anything else is a protocol violation and the server drops the
//! connection together with every descriptor it registered.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::ControlPaths;
use crate::fdpass;

/// Errors from the veto client protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connection or transfer failure.
    #[error("veto service I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The service closed the connection.
    #[error("veto service closed the connection")]
    Closed,

    /// The service sent a byte outside the protocol.
    #[error("unexpected protocol byte {byte:#04x}")]
    UnexpectedByte {
        /// The offending byte.
        byte: u8,
    },
}

/// Notification from the veto service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VetoEvent {
    /// Suspend is imminent and one of the registered descriptors is
    /// readable; drain it, then call [`WakeSource::ready`].
    SuspendImminent,
    /// The suspend cycle ended; no reply is expected.
    CycleOver,
}

/// A registration of wake-event descriptors with the veto service.
///
/// Dropping the handle closes the connection, which unregisters every
/// descriptor it passed.
#[derive(Debug)]
pub struct WakeSource {
    stream: UnixStream,
}

impl WakeSource {
    /// Register `fds` with the veto service.
    pub async fn register(paths: &ControlPaths, fds: &[RawFd]) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(paths.registration_socket()).await?;
        let mut source = Self { stream };

        source.expect_ack().await?; // greeting
        source.send_registration(fds).await?;
        source.expect_ack().await?; // registration ack

        debug!(count = fds.len(), "registered descriptors with veto service");
        Ok(source)
    }

    /// Wait for the next service notification. Cancel safe.
    pub async fn next(&mut self) -> Result<VetoEvent, ProtocolError> {
        match self.read_byte().await? {
            b'S' => Ok(VetoEvent::SuspendImminent),
            b'A' => Ok(VetoEvent::CycleOver),
            byte => Err(ProtocolError::UnexpectedByte { byte }),
        }
    }

    /// Report that every readable descriptor has been drained.
    pub async fn ready(&mut self) -> Result<(), ProtocolError> {
        self.write_byte(b'R').await
    }

    async fn expect_ack(&mut self) -> Result<(), ProtocolError> {
        match self.read_byte().await? {
            b'A' => Ok(()),
            byte => Err(ProtocolError::UnexpectedByte { byte }),
        }
    }

    async fn send_registration(&mut self, fds: &[RawFd]) -> Result<(), ProtocolError> {
        let raw = self.stream.as_raw_fd();
        self.stream
            .async_io(Interest::WRITABLE, || {
                fdpass::send_with_fds(raw, b"W", fds)
            })
            .await?;
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        let mut buf = [0u8; 1];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        Ok(buf[0])
    }

    async fn write_byte(&mut self, byte: u8) -> Result<(), ProtocolError> {
        self.stream.write_all(&[byte]).await?;
        Ok(())
    }
}
