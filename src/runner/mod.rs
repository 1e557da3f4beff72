//! The pluggable argv-execution seam behind the iptables and `ip rule`
//! builders. The original implementation shells out directly; this crate
//! keeps that same argv-vector-in, status-out contract but makes the
//! executor swappable so the builders can be tested with a recording double
//! instead of mutating real netfilter/routing state.

use std::process::Command;

use crate::error::{Error, Result};

/// Executes an external command by name with arguments and reports failure.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<()>;
}

/// Shells out via `std::process::Command`. No `/bin/sh -c` wrapper: args are
/// passed as an argv vector, never interpolated into a shell string.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::permission(format!("exec {program}: {e}")))?;
        if !output.status.success() {
            return Err(Error::permission(format!(
                "{program} {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Test double: records every `(program, args)` invocation instead of
/// executing it, so builder tests can assert that a teardown argv is the
/// exact reverse of the corresponding insert argv.
#[derive(Default)]
pub struct RecordingProcessRunner {
    pub calls: parking_lot::Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

impl ProcessRunner for RecordingProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<()> {
        self.calls.lock().push((program.to_string(), args.to_vec()));
        Ok(())
    }
}
