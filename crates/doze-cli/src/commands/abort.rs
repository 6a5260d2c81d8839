//! `doze abort` - invalidate any in-flight suspend attempt.

use anyhow::{Context, Result};
use doze_core::{AbortSeq, ControlPaths};

use crate::exit_codes;

pub fn run(paths: &ControlPaths) -> Result<u8> {
    let value = AbortSeq::bump(paths).context("failed to bump abort counter")?;
    println!("abort counter now {value}");
    Ok(exit_codes::SUCCESS)
}
