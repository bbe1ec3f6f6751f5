use anyhow::{Context, Error};

use crate::dependencies::Dependency;
use crate::exe::RunAndCheck;

/// Waits until the udev event queue is empty or `timeout` seconds passed.
/// Only events already queued are waited for; callers racing the kernel must
/// give it time to enqueue them first.
pub fn settle(timeout: u64) -> Result<(), Error> {
    Dependency::Udevadm
        .cmd()
        .arg("settle")
        .arg(format!("--timeout={timeout}"))
        .run_and_check()
        .context("Failed to settle udev")
}

pub fn trigger() -> Result<(), Error> {
    Dependency::Udevadm
        .cmd()
        .arg("trigger")
        .run_and_check()
        .context("Failed to trigger udev")
}
