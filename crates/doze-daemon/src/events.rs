//! The fd-readiness veto service.
//!
//! Clients hand this daemon descriptors that produce wake events. Just
//! before every suspend attempt the service polls them with a zero
//! timeout; if nothing is readable the attempt proceeds with no added
//! latency, otherwise each owning connection is told `S` and the
//! acknowledgment to the coordinator is deferred until every owner has
//! drained its descriptor and replied `R`. Combining "has data arrived"
//! with the explicit handshake is what prevents suspending while an event
//! is mid-delivery to a client that has not read it yet.
//!
//! The service is single-threaded: one task owns all connection state and
//! the embedded suspend watcher; per-connection reader tasks share the
//! stream by reference counting and forward parsed messages over a
//! channel. A connection that violates the protocol, or disconnects, is
//! torn down together with its descriptors - including mid-handshake,
//! where its outstanding reply is forgiven so one dead client cannot
//! stall suspend forever.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::rc::Rc;

use doze_core::config::ControlPaths;
use doze_core::fdpass;
use doze_core::watch::{SuspendEvent, SuspendWatcher, WatchError};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::socket;

/// Errors from the veto service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Socket setup or accept failure.
    #[error("veto service I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The embedded suspend watcher failed.
    #[error(transparent)]
    Watch(#[from] WatchError),
}

type ConnId = u64;

/// Parsed input from one connection's reader task.
enum Msg {
    /// `W`: watch these descriptors.
    Register { id: ConnId, fds: Vec<OwnedFd> },
    /// `R`: descriptor drained, ready for suspend.
    Ready { id: ConnId },
    /// A byte outside the protocol.
    Violation { id: ConnId, byte: u8 },
    /// EOF or read error.
    Closed { id: ConnId },
}

struct Client {
    stream: Rc<UnixStream>,
    fds: Vec<OwnedFd>,
    /// `S` sent this cycle.
    sent: bool,
    /// `R` still outstanding.
    awaiting_ready: bool,
}

#[derive(Default)]
struct ServiceState {
    clients: HashMap<ConnId, Client>,
    next_id: ConnId,
    /// Outstanding `R` replies this cycle.
    waiting: usize,
    /// Acknowledgment to the coordinator is deferred.
    suspending: bool,
}

/// Run the veto service until its environment fails.
///
/// Must run inside a `LocalSet`; reader tasks are spawned locally.
pub async fn run(paths: ControlPaths) -> Result<(), ServiceError> {
    let listener = socket::bind_socket(&paths.registration_socket())?;
    let mut watcher = SuspendWatcher::attach(&paths).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = ServiceState::default();

    info!("fd-readiness veto service ready");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => state.handle_accept(stream, &tx),
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(msg) = rx.recv() => state.handle_msg(msg, &mut watcher)?,
            event = watcher.next_event() => match event? {
                SuspendEvent::Suspending => state.handle_suspending(&mut watcher)?,
                SuspendEvent::Resumed => state.handle_resumed(),
            },
        }
    }
}

impl ServiceState {
    fn handle_accept(&mut self, stream: UnixStream, tx: &mpsc::UnboundedSender<Msg>) {
        let stream = Rc::new(stream);
        // Greeting; a client that cannot take one byte is not worth
        // tracking.
        if let Err(e) = stream.try_write(b"A") {
            warn!(error = %e, "client rejected greeting");
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(
            id,
            Client {
                stream: Rc::clone(&stream),
                fds: Vec::new(),
                sent: false,
                awaiting_ready: false,
            },
        );
        debug!(conn = id, "client connected");

        let tx = tx.clone();
        tokio::task::spawn_local(read_loop(id, stream, tx));
    }

    fn handle_msg(&mut self, msg: Msg, watcher: &mut SuspendWatcher) -> Result<(), ServiceError> {
        match msg {
            Msg::Register { id, fds } => {
                if let Some(client) = self.clients.get_mut(&id) {
                    debug!(conn = id, count = fds.len(), "descriptors registered");
                    client.fds.extend(fds);
                    if let Err(e) = client.stream.try_write(b"A") {
                        warn!(conn = id, error = %e, "registration ack failed");
                        self.teardown(id, watcher)?;
                    }
                }
            }
            Msg::Ready { id } => {
                if let Some(client) = self.clients.get_mut(&id) {
                    if client.awaiting_ready {
                        client.awaiting_ready = false;
                        self.reply_arrived(watcher)?;
                    }
                }
            }
            Msg::Violation { id, byte } => {
                debug!(conn = id, byte, "protocol violation");
                self.teardown(id, watcher)?;
            }
            Msg::Closed { id } => {
                debug!(conn = id, "client disconnected");
                self.teardown(id, watcher)?;
            }
        }
        Ok(())
    }

    /// Poll every registered descriptor; defer acknowledgment while any
    /// owner still has unread data.
    fn handle_suspending(&mut self, watcher: &mut SuspendWatcher) -> Result<(), ServiceError> {
        for client in self.clients.values_mut() {
            client.sent = false;
        }

        let readable = self.readable_clients();
        for id in readable {
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            if client.sent {
                continue;
            }
            client.sent = true;
            client.awaiting_ready = true;
            self.waiting += 1;
            trace!(conn = id, "suspend deferred on readable descriptor");
            if let Err(e) = client.stream.try_write(b"S") {
                warn!(conn = id, error = %e, "suspend notice failed");
            }
        }

        if self.waiting == 0 {
            watcher.acknowledge()?;
        } else {
            debug!(waiting = self.waiting, "deferring suspend acknowledgment");
            self.suspending = true;
        }
        Ok(())
    }

    /// Cycle over: anyone who got an `S` learns suspend did not (yet)
    /// happen.
    fn handle_resumed(&mut self) {
        for (id, client) in &mut self.clients {
            if client.sent {
                client.sent = false;
                if let Err(e) = client.stream.try_write(b"A") {
                    warn!(conn = *id, error = %e, "resume notice failed");
                }
            }
        }
    }

    fn reply_arrived(&mut self, watcher: &mut SuspendWatcher) -> Result<(), ServiceError> {
        self.waiting -= 1;
        if self.waiting == 0 && self.suspending {
            self.suspending = false;
            watcher.acknowledge()?;
        }
        Ok(())
    }

    fn teardown(&mut self, id: ConnId, watcher: &mut SuspendWatcher) -> Result<(), ServiceError> {
        if let Some(client) = self.clients.remove(&id) {
            // The reader task shares the stream; shut the socket down so
            // it observes EOF and exits, and the client sees the close.
            let _ = nix::sys::socket::shutdown(
                client.stream.as_raw_fd(),
                nix::sys::socket::Shutdown::Both,
            );
            // Descriptors close with the handle. An outstanding reply is
            // forgiven so a dead client cannot stall the rotation.
            if client.awaiting_ready {
                self.reply_arrived(watcher)?;
            }
        }
        Ok(())
    }

    fn readable_clients(&self) -> Vec<ConnId> {
        let entries: Vec<(ConnId, &OwnedFd)> = self
            .clients
            .iter()
            .flat_map(|(id, client)| client.fds.iter().map(move |fd| (*id, fd)))
            .collect();
        if entries.is_empty() {
            return Vec::new();
        }

        let mut pollfds: Vec<PollFd> = entries
            .iter()
            .map(|(_, fd)| PollFd::new(fd.as_fd(), PollFlags::POLLIN | PollFlags::POLLPRI))
            .collect();
        if let Err(errno) = poll(&mut pollfds, PollTimeout::ZERO) {
            warn!(error = %errno, "descriptor sweep failed");
            return Vec::new();
        }

        entries
            .iter()
            .zip(&pollfds)
            .filter(|(_, pollfd)| {
                pollfd
                    .revents()
                    .is_some_and(|revents| !revents.is_empty())
            })
            .map(|((id, _), _)| *id)
            .collect()
    }
}

async fn read_loop(id: ConnId, stream: Rc<UnixStream>, tx: mpsc::UnboundedSender<Msg>) {
    let mut buf = [0u8; 1];
    loop {
        let received = stream
            .async_io(Interest::READABLE, || {
                fdpass::recv_with_fds(stream.as_raw_fd(), &mut buf)
            })
            .await;
        let msg = match received {
            Ok((0, _)) => Msg::Closed { id },
            Ok((_, fds)) if buf[0] == b'W' => Msg::Register { id, fds },
            Ok((_, _)) if buf[0] == b'R' => Msg::Ready { id },
            Ok((_, _)) => Msg::Violation { id, byte: buf[0] },
            Err(e) => {
                trace!(conn = id, error = %e, "read failed");
                Msg::Closed { id }
            }
        };
        let terminal = matches!(msg, Msg::Closed { .. } | Msg::Violation { .. });
        if tx.send(msg).is_err() || terminal {
            return;
        }
    }
}
