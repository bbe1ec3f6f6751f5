use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use anyhow::{anyhow, bail, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Extension for `std::process::Command` that runs the command, traces the
/// invocation and checks the exit status, producing an error that carries
/// the captured output. This is a sealed trait.
pub trait RunAndCheck: Sealed {
    /// Run and require success.
    fn run_and_check(&mut self) -> Result<(), Error>;

    /// Run, require success, and return stdout.
    fn output_and_check(&mut self) -> Result<String, Error>;

    /// Render the command line for error messages.
    fn render_command(&self) -> String;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        self.output_and_check().map(|_| ())
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute: {rendered}"))?;
        trace!("Executed '{rendered}': {}", explain_exit(&output));

        if !output.status.success() {
            let report = output_report(&output);
            let explanation = explain_exit(&output);
            return Err(match report {
                s if !s.is_empty() => anyhow!("Process output:\n{s}").context(explanation),
                _ => anyhow!("(No output was captured)").context(explanation),
            })
            .with_context(|| format!("Error when running: {rendered}"));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into())
    }

    fn render_command(&self) -> String {
        let program = self.get_program().to_string_lossy();
        if self.get_args().count() == 0 {
            return program.into();
        }
        format!(
            "{} {}",
            program,
            self.get_args()
                .map(|arg| arg.to_string_lossy())
                .map(|arg| if arg.contains(' ') {
                    format!("'{arg}'")
                } else {
                    arg.into()
                })
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

fn explain_exit(output: &Output) -> String {
    if let Some(code) = output.status.code() {
        format!("process exited with status: {code}")
    } else if let Some(signal) = output.status.signal() {
        format!("process was terminated by signal: {signal}")
    } else {
        "process exited with unknown status".into()
    }
}

fn output_report(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);
    if !stdout.trim().is_empty() {
        res += &format!("stdout:\n{stdout}\n");
    }
    if !stderr.trim().is_empty() {
        if !res.is_empty() {
            res += "\n";
        }
        res += &format!("stderr:\n{stderr}\n");
    }
    res
}

/// Run a command and report only whether it succeeded, swallowing execution
/// errors. For probes where failure is an answer, not a problem.
pub fn succeeds(command: &mut Command) -> bool {
    command
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
