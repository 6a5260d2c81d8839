//! `doze watch` - print suspend/resume events as they happen.
//!
//! Acknowledges each suspend announcement immediately; this observer never
//! delays anyone's sleep.

use anyhow::{Context, Result};
use doze_core::{ControlPaths, SuspendEvent, SuspendWatcher};

use crate::exit_codes;

pub fn run(paths: &ControlPaths) -> Result<u8> {
    let runtime = super::runtime()?;
    let result: Result<()> = runtime.block_on(async {
        let mut watcher = SuspendWatcher::attach(paths)
            .await
            .context("failed to attach watcher; is the coordinator running?")?;
        loop {
            match watcher.next_event().await.context("watch failed")? {
                SuspendEvent::Suspending => {
                    println!("suspending");
                    watcher.acknowledge().context("acknowledgment failed")?;
                }
                SuspendEvent::Resumed => println!("resumed"),
            }
        }
    });
    result.map(|()| exit_codes::SUCCESS)
}
