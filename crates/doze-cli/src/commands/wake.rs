//! `doze wake <when>` - schedule a wake-up and wait for it.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use doze_core::alarm::WakeAlarm;
use doze_core::ControlPaths;

use crate::exit_codes;

pub fn run(paths: &ControlPaths, when: &str) -> Result<u8> {
    let deadline = parse_deadline(when)?;
    let runtime = super::runtime()?;
    runtime.block_on(async {
        let mut alarm = WakeAlarm::connect(paths)
            .await
            .context("failed to connect; is the wake-alarm service running?")?;
        let accepted = alarm.schedule(deadline).await.context("scheduling failed")?;
        println!("wake-up scheduled for {accepted}");
        alarm
            .wait_for_fire()
            .await
            .context("lost the wake-alarm service while waiting")?;
        println!("now");
        Ok(exit_codes::SUCCESS)
    })
}

/// Either an absolute epoch timestamp or `+N` seconds from now.
fn parse_deadline(when: &str) -> Result<i64> {
    let deadline = if let Some(offset) = when.strip_prefix('+') {
        let offset: i64 = offset
            .parse()
            .with_context(|| format!("invalid offset {when:?}"))?;
        unix_now() + offset
    } else {
        when.parse()
            .with_context(|| format!("invalid timestamp {when:?}"))?
    };
    Ok(deadline)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_deadline() {
        assert_eq!(parse_deadline("1700000000").unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_relative_deadline() {
        let before = unix_now();
        let parsed = parse_deadline("+60").unwrap();
        assert!(parsed >= before + 60);
        assert!(parsed <= unix_now() + 60);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_deadline("soon").is_err());
        assert!(parse_deadline("+later").is_err());
    }
}
