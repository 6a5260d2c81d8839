//! `doze inhibit -- <command>` - veto suspend while a command runs.

use std::process::Command;

use anyhow::{bail, Context, Result};
use doze_core::{ControlPaths, Inhibitor};

use crate::exit_codes;

pub fn run(paths: &ControlPaths, command: &[String]) -> Result<u8> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };

    let mut inhibitor = Inhibitor::open(paths).context("failed to open inhibitor lock")?;
    inhibitor.block().context("failed to take inhibitor lock")?;

    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program}"));

    inhibitor.allow().context("failed to release inhibitor lock")?;

    let status = status?;
    let code = status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(exit_codes::GENERIC_ERROR);
    Ok(code)
}
