//! `doze request` - request a suspend and report how it concluded.

use anyhow::{Context, Result};
use doze_core::{request_suspend, ControlPaths, ImmediateRequest, SuspendOutcome};

use crate::exit_codes;

pub fn run(paths: &ControlPaths, immediate: bool) -> Result<u8> {
    let runtime = super::runtime()?;

    let immediate_marker = if immediate {
        Some(ImmediateRequest::create(paths).context("failed to place immediate marker")?)
    } else {
        None
    };

    let outcome = runtime
        .block_on(request_suspend(paths))
        .context("suspend request failed");

    // Withdraw the immediate marker whether or not the request concluded
    // cleanly; a dead marker would only be reclaimed on the next cycle.
    if let Some(marker) = immediate_marker {
        marker.release().context("failed to withdraw immediate marker")?;
    }

    match outcome? {
        SuspendOutcome::Suspended => {
            println!("suspended");
            Ok(exit_codes::SUCCESS)
        }
        SuspendOutcome::Blocked => {
            println!("blocked");
            Ok(exit_codes::BLOCKED)
        }
    }
}
