//! Client side of the wake-alarm service.
//!
//! Line-oriented protocol: the client sends a decimal Unix timestamp and
//! the service echoes the accepted value back. When the deadline passes the
//! service sends `Now`. Re-sending a timestamp replaces the previous one;
//! zero means "never". The service keeps the machine awake from the moment
//! a deadline fires until it is replaced or the connection closes, and
//! programs the wake hardware so the machine is running when the deadline
//! arrives even if it suspended in between.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::ControlPaths;

/// The line announcing a fired deadline.
const FIRE_LINE: &str = "Now";

/// Errors from the wake-alarm client protocol.
#[derive(Debug, Error)]
pub enum AlarmError {
    /// Connection or transfer failure.
    #[error("wake-alarm service I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The service closed the connection.
    #[error("wake-alarm service closed the connection")]
    Closed,

    /// The service sent a line that is not a decimal timestamp.
    #[error("malformed wake-alarm reply: {line:?}")]
    Malformed {
        /// The offending line.
        line: String,
    },
}

/// A connection to the wake-alarm service carrying one deadline.
///
/// Dropping the handle cancels the deadline.
#[derive(Debug)]
pub struct WakeAlarm {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl WakeAlarm {
    /// Connect to the wake-alarm service.
    ///
    /// The connection starts with no deadline; the service greets with the
    /// current (zero) value.
    pub async fn connect(paths: &ControlPaths) -> Result<Self, AlarmError> {
        let stream = UnixStream::connect(paths.wakealarm_socket()).await?;
        let (read_half, writer) = stream.into_split();
        let mut alarm = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        let greeting = alarm.read_decimal_line().await?;
        debug!(greeting, "connected to wake-alarm service");
        Ok(alarm)
    }

    /// Set (or replace) the deadline, seconds since the Unix epoch.
    ///
    /// Returns the value the service accepted. Zero cancels the deadline.
    pub async fn schedule(&mut self, when: i64) -> Result<i64, AlarmError> {
        self.writer.write_all(format!("{when}\n").as_bytes()).await?;
        let echoed = self.read_decimal_line().await?;
        debug!(when, echoed, "scheduled wake-up");
        Ok(echoed)
    }

    /// Wait until the service announces the deadline has passed.
    ///
    /// Echo lines from concurrent re-registrations are skipped.
    pub async fn wait_for_fire(&mut self) -> Result<(), AlarmError> {
        loop {
            let line = self.read_line().await?;
            if line.trim() == FIRE_LINE {
                return Ok(());
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, AlarmError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(AlarmError::Closed);
        }
        Ok(line)
    }

    async fn read_decimal_line(&mut self) -> Result<i64, AlarmError> {
        let line = self.read_line().await?;
        line.trim()
            .parse()
            .map_err(|_| AlarmError::Malformed { line })
    }
}
