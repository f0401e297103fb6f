//! Host command execution.
//!
//! A small builder around [`std::process::Command`] that captures output,
//! logs the invocation, and turns a non-zero exit into an error carrying a
//! caller-supplied hint (usually which package provides the tool).

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Command builder.
///
/// ```rust,ignore
/// use obelion_builder::process::Cmd;
///
/// let out = Cmd::new("losetup")
///     .args(["--find", "--show", "--read-only"])
///     .arg_path(image)
///     .error_msg("losetup failed. Install util-linux.")
///     .run()?;
/// ```
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Render the command line for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run(self) -> Result<CmdResult> {
        let rendered = self.display();
        debug!(command = %rendered, "running host command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("Failed to spawn '{}'", rendered))?;

        let result = CmdResult {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success() || self.allow_fail {
            return Ok(result);
        }

        let hint = self
            .error_msg
            .unwrap_or_else(|| format!("'{}' failed", rendered));
        bail!(
            "{}\n  command: {}\n  exit: {}\n  stderr: {}",
            hint,
            rendered,
            result
                .status
                .map_or_else(|| "signal".to_string(), |code| code.to_string()),
            result.stderr.trim()
        )
    }
}
