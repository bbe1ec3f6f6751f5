//! Host QoS via traffic control. A device with outbound QoS carries an hfsc
//! root qdisc with a single link-share class.

use anyhow::{Context, Error};

use crate::dependencies::Dependency;
use crate::exe::RunAndCheck;

/// Applies an outbound link-share guarantee of `ls_m2` bits per second.
pub fn apply_out_rate(dev: &str, ls_m2: u64) -> Result<(), Error> {
    Dependency::Tc
        .cmd()
        .args(["qdisc", "replace", "dev", dev, "root", "handle", "1:", "hfsc", "default", "1"])
        .run_and_check()
        .with_context(|| format!("Failed to install root qdisc on {dev}"))?;
    let rate = format!("{ls_m2}bit");
    Dependency::Tc
        .cmd()
        .args([
            "class",
            "replace",
            "dev",
            dev,
            "parent",
            "1:",
            "classid",
            "1:1",
            "hfsc",
            "ls",
            "m2",
            rate.as_str(),
        ])
        .run_and_check()
        .with_context(|| format!("Failed to install link-share class on {dev}"))
}

/// Removes any root qdisc from the device. Absence is not an error.
pub fn clear(dev: &str) -> Result<(), Error> {
    let _ = Dependency::Tc
        .cmd()
        .args(["qdisc", "del", "dev", dev, "root"])
        .run_and_check();
    Ok(())
}
