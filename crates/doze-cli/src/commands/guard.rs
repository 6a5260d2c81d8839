//! `doze guard --fd <n>` - register an inherited descriptor with the veto
//! service and keep the S/R handshake honest.
//!
//! On each suspend announcement the guarded descriptor is drained
//! (best effort, whatever is immediately readable) before `R` is sent, so
//! suspend never proceeds over buffered wake events.

use std::os::fd::{BorrowedFd, RawFd};

use anyhow::{Context, Result};
use doze_core::veto::{VetoEvent, WakeSource};
use doze_core::ControlPaths;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::exit_codes;

pub fn run(paths: &ControlPaths, fd: RawFd) -> Result<u8> {
    let runtime = super::runtime()?;
    let result: Result<()> = runtime.block_on(async {
        let mut source = WakeSource::register(paths, &[fd])
            .await
            .context("failed to register; is the veto service running?")?;
        println!("guarding fd {fd}");

        loop {
            match source.next().await.context("veto service failed")? {
                VetoEvent::SuspendImminent => {
                    let drained = drain(fd)?;
                    println!("suspend imminent, drained {drained} bytes");
                    source.ready().await.context("ready reply failed")?;
                }
                VetoEvent::CycleOver => println!("cycle over"),
            }
        }
    });
    result.map(|()| exit_codes::SUCCESS)
}

/// Read whatever is immediately available from the descriptor.
fn drain(fd: RawFd) -> Result<usize> {
    use std::io::Read;

    // SAFETY: the caller handed us this descriptor for the lifetime of
    // the process; it stays open.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut reader = std::fs::File::from(
        borrowed
            .try_clone_to_owned()
            .context("failed to duplicate guarded descriptor")?,
    );

    let mut total = 0;
    let mut buf = [0u8; 4096];
    loop {
        // Only read what poll vouches for; the descriptor may be in
        // blocking mode.
        let mut pollfds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let ready = poll(&mut pollfds, PollTimeout::ZERO).context("poll failed")?;
        if ready == 0 {
            return Ok(total);
        }
        match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) => return Err(e).context("read failed"),
        }
    }
}
