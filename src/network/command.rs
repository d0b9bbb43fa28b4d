//! External tool invocation (`tc`, `iptables`)
//!
//! Wrapper around the binaries rather than netlink; every call is
//! synchronous and has no timeout.

use log::debug;
use std::fmt;
use std::process::Command;

use crate::error::{Error, Result};

/// What a failed invocation means for the surrounding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Failure aborts the operation
    Required,
    /// Failure is expected (entity absent or already present) and only logged
    Tolerated,
}

/// One planned tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
    pub policy: FailurePolicy,
}

impl Invocation {
    pub fn tc<I, S>(args: I, policy: FailurePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: "tc",
            args: args.into_iter().map(Into::into).collect(),
            policy,
        }
    }

    pub fn iptables<I, S>(args: I, policy: FailurePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: "iptables",
            args: args.into_iter().map(Into::into).collect(),
            policy,
        }
    }

    pub fn command_line(&self) -> String {
        let mut line = String::from(self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Seam between the engine and the host tools.
pub trait CommandRunner: Send + Sync {
    /// Run `program args..` and return its stdout. Non-zero exit or a
    /// missing binary is `ShapingCommandFailed`.
    fn run(&self, program: &str, args: &[String]) -> Result<String>;

    /// Run a planned invocation, honouring its failure policy.
    fn execute(&self, invocation: &Invocation) -> Result<()> {
        match self.run(invocation.program, &invocation.args) {
            Ok(_) => Ok(()),
            Err(e) if invocation.policy == FailurePolicy::Tolerated => {
                debug!("Ignoring failure of `{}`: {}", invocation, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn execute_all(&self, invocations: &[Invocation]) -> Result<()> {
        invocations.iter().try_for_each(|i| self.execute(i))
    }
}

/// Runs the real binaries found on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Run command: {}", command_line);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::ShapingCommandFailed {
                command: command_line.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ShapingCommandFailed {
                command: command_line,
                reason: format!("{} ({})", stderr.trim(), output.status),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
