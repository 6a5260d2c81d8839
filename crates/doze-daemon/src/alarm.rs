//! The wake-alarm service.
//!
//! Clients connect and register one wake deadline each (seconds since the
//! Unix epoch; zero means "never"). The service keeps its connections
//! ordered by deadline, runs a single timer at the earliest pending one,
//! and tells each connection `Now` exactly once when its deadline passes.
//! A fired deadline counts as "active" until it is replaced or the
//! connection closes, and the service holds the inhibitor lock shared
//! while any connection is active - a wake-up nobody has handled yet must
//! not be slept through.
//!
//! The service also participates in suspend as a watcher: when suspend is
//! imminent it either programs the RTC so the machine is back up ahead of
//! the earliest deadline, or - if that deadline is only seconds away -
//! takes the inhibitor lock itself, because suspending and waking again
//! would cost more than staying up. After resume the timer is recomputed
//! against the wall clock; hardware alarms are not monotonic across
//! sleep.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use doze_core::config::ControlPaths;
use doze_core::inhibit::{Inhibitor, LockError};
use doze_core::watch::{SuspendEvent, SuspendWatcher, WatchError};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::AlarmConfig;
use crate::power::RtcWakeAlarm;
use crate::socket;

/// Longest accepted registration line.
const MAX_LINE_LEN: usize = 32;

/// Errors from the wake-alarm service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Socket setup or accept failure.
    #[error("wake-alarm service I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The embedded suspend watcher failed.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The inhibitor lock failed.
    #[error(transparent)]
    Lock(#[from] LockError),
}

type ConnId = u64;

enum Msg {
    /// One newline-terminated registration line.
    Line { id: ConnId, line: String },
    /// Overlong or unreadable input.
    Violation { id: ConnId },
    /// EOF or read error.
    Closed { id: ConnId },
}

struct AlarmConn {
    stream: Rc<UnixStream>,
    /// Seconds since the epoch; zero means "never".
    deadline: i64,
    /// Deadline has fired and was not yet replaced.
    active: bool,
}

struct AlarmState {
    conns: HashMap<ConnId, AlarmConn>,
    /// Pending (not yet fired) deadlines, earliest first.
    queue: BTreeSet<(i64, ConnId)>,
    next_id: ConnId,
    /// Fired-but-unreplaced deadlines.
    active_count: usize,
    inhibitor: Inhibitor,
    rtc: RtcWakeAlarm,
    margin_secs: i64,
    lead_secs: i64,
}

/// Seconds since the Unix epoch.
fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Run the wake-alarm service until its environment fails.
///
/// Must run inside a `LocalSet`; reader tasks are spawned locally.
pub async fn run(paths: ControlPaths, config: AlarmConfig) -> Result<(), ServiceError> {
    let listener = socket::bind_socket(&paths.wakealarm_socket())?;
    let inhibitor = Inhibitor::open(&paths)?;
    let mut watcher = SuspendWatcher::attach(&paths).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = AlarmState {
        conns: HashMap::new(),
        queue: BTreeSet::new(),
        next_id: 0,
        active_count: 0,
        inhibitor,
        rtc: RtcWakeAlarm::new(config.rtc_wakealarm),
        margin_secs: i64::try_from(config.margin_secs).unwrap_or(i64::MAX),
        lead_secs: i64::try_from(config.lead_secs).unwrap_or(0),
    };

    info!("wake-alarm service ready");
    loop {
        let next_fire = state.next_fire_in();
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => state.handle_accept(stream, &tx),
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(msg) = rx.recv() => state.handle_msg(msg)?,
            () = sleep_maybe(next_fire) => {
                state.fire_due(unix_now())?;
            }
            event = watcher.next_event() => match event? {
                SuspendEvent::Suspending => state.will_suspend(&mut watcher)?,
                SuspendEvent::Resumed => {
                    // Hardware time moved while we slept; catch up.
                    state.fire_due(unix_now())?;
                }
            },
        }
    }
}

/// Sleep until the given delay elapses, or forever when there is none.
async fn sleep_maybe(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

impl AlarmState {
    fn handle_accept(&mut self, stream: UnixStream, tx: &mpsc::UnboundedSender<Msg>) {
        let stream = Rc::new(stream);
        // Greeting: the connection's current (zero) deadline.
        if let Err(e) = stream.try_write(b"0\n") {
            warn!(error = %e, "client rejected greeting");
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.conns.insert(
            id,
            AlarmConn {
                stream: Rc::clone(&stream),
                deadline: 0,
                active: false,
            },
        );
        debug!(conn = id, "client connected");

        let tx = tx.clone();
        tokio::task::spawn_local(read_loop(id, stream, tx));
    }

    fn handle_msg(&mut self, msg: Msg) -> Result<(), ServiceError> {
        match msg {
            Msg::Line { id, line } => match line.trim().parse::<i64>() {
                Ok(deadline) if deadline >= 0 => self.reschedule(id, deadline)?,
                _ => {
                    debug!(conn = id, line = line.trim(), "malformed deadline");
                    self.teardown(id)?;
                }
            },
            Msg::Violation { id } => {
                debug!(conn = id, "protocol violation");
                self.teardown(id)?;
            }
            Msg::Closed { id } => {
                debug!(conn = id, "client disconnected");
                self.teardown(id)?;
            }
        }
        Ok(())
    }

    /// Replace a connection's deadline.
    fn reschedule(&mut self, id: ConnId, deadline: i64) -> Result<(), ServiceError> {
        let now = unix_now();
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };

        self.queue.remove(&(conn.deadline, id));
        if conn.active {
            conn.active = false;
            self.active_count -= 1;
        }
        conn.deadline = deadline;

        if let Err(e) = conn.stream.try_write(format!("{deadline}\n").as_bytes()) {
            warn!(conn = id, error = %e, "echo failed");
            self.teardown(id)?;
            return Ok(());
        }
        debug!(conn = id, deadline, "deadline registered");

        if deadline > now {
            self.queue.insert((deadline, id));
        } else if deadline > 0 {
            // Already due: exactly one Now, straight away.
            self.fire_conn(id);
        }
        self.maintain_inhibit(now)
    }

    /// Fire every deadline that has passed.
    fn fire_due(&mut self, now: i64) -> Result<(), ServiceError> {
        while let Some(&(deadline, id)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.pop_first();
            self.fire_conn(id);
        }
        self.maintain_inhibit(now)
    }

    fn fire_conn(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.active {
            conn.active = true;
            self.active_count += 1;
        }
        debug!(conn = id, deadline = conn.deadline, "deadline fired");
        if let Err(e) = conn.stream.try_write(b"Now\n") {
            warn!(conn = id, error = %e, "fire notice failed");
        }
    }

    /// Suspend is imminent: arm the hardware or keep the machine up.
    fn will_suspend(&mut self, watcher: &mut SuspendWatcher) -> Result<(), ServiceError> {
        let now = unix_now();
        // The timer may not have run yet for deadlines that just passed.
        self.fire_due(now)?;

        if let Some(&(deadline, _)) = self.queue.first() {
            if deadline - now > self.margin_secs {
                if let Err(e) = self.rtc.program(deadline - self.lead_secs) {
                    // Without the hardware alarm the wake-up would be
                    // lost; keep the machine up instead.
                    warn!(error = %e, "RTC programming failed, blocking suspend");
                    self.inhibitor.block()?;
                }
            }
            // A deadline inside the margin keeps the inhibitor held via
            // maintain_inhibit below.
        }
        self.maintain_inhibit(now)?;
        watcher.acknowledge()?;
        Ok(())
    }

    fn teardown(&mut self, id: ConnId) -> Result<(), ServiceError> {
        if let Some(conn) = self.conns.remove(&id) {
            self.queue.remove(&(conn.deadline, id));
            if conn.active {
                self.active_count -= 1;
            }
            // The reader task shares the stream; shut the socket down so
            // it observes EOF and exits, and the client sees the close.
            let _ = nix::sys::socket::shutdown(
                conn.stream.as_raw_fd(),
                nix::sys::socket::Shutdown::Both,
            );
        }
        self.maintain_inhibit(unix_now())
    }

    /// Hold the inhibitor lock exactly while suspend must not happen:
    /// some deadline has fired and was not handled, or the next one is
    /// too close to sleep through.
    fn maintain_inhibit(&mut self, now: i64) -> Result<(), ServiceError> {
        let imminent = self
            .queue
            .first()
            .is_some_and(|&(deadline, _)| deadline - now <= self.margin_secs);
        let should_block = self.active_count > 0 || imminent;

        if should_block && !self.inhibitor.is_blocking() {
            trace!(
                active = self.active_count,
                imminent, "blocking suspend"
            );
            self.inhibitor.block()?;
        } else if !should_block && self.inhibitor.is_blocking() {
            trace!("allowing suspend");
            self.inhibitor.allow()?;
        }
        Ok(())
    }

    /// Delay until the earliest pending deadline, if any.
    fn next_fire_in(&self) -> Option<Duration> {
        let &(deadline, _) = self.queue.first()?;
        let remaining = u64::try_from(deadline.saturating_sub(unix_now())).unwrap_or(0);
        Some(Duration::from_secs(remaining))
    }
}

async fn read_loop(id: ConnId, stream: Rc<UnixStream>, tx: mpsc::UnboundedSender<Msg>) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = match stream
            .async_io(Interest::READABLE, || stream.try_read(&mut buf))
            .await
        {
            Ok(0) | Err(_) => {
                let _ = tx.send(Msg::Closed { id });
                return;
            }
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                if tx.send(Msg::Line { id, line }).is_err() {
                    return;
                }
            } else {
                pending.push(byte);
                if pending.len() > MAX_LINE_LEN {
                    let _ = tx.send(Msg::Violation { id });
                    return;
                }
            }
        }
    }
}
