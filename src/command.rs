// External process execution for drivers
//
// Every OS tool a driver needs (netsh, cmd, powershell) is spawned through a
// CommandRunner so drivers can be exercised without a Windows host.

use crate::error::{NatError, Result};
use std::process::Command;

/// Captured result of one external process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit status as reported by the OS (e.g. "exit code: 1")
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            status: "exit code: 0".to_string(),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and streams
    pub fn failed(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            status: format!("exit code: {}", code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Turn a non-zero exit into `NatError::CommandFailed`, logging both streams
    pub fn check(self, command: &str) -> Result<CommandOutput> {
        if self.success {
            return Ok(self);
        }

        log::error!("{} failed ({})", command, self.status);
        if !self.stdout.trim().is_empty() {
            log::error!("stdout: {}", self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            log::error!("stderr: {}", self.stderr.trim_end());
        }

        Err(NatError::CommandFailed {
            command: command.to_string(),
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Spawns external programs and waits for them to finish
pub trait CommandRunner: Send + Sync {
    /// Run `program` with an argument vector (OS argument quoting applies)
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run a complete command line through the platform shell (`cmd /C` on Windows)
    fn run_shell(&self, line: &str) -> Result<CommandOutput>;
}

/// Runs commands on the local host via `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        log::debug!("Executing: {}", render_command_line(program, args));

        let mut command = Command::new(program);
        command.args(args);
        capture(program, &mut command)
    }

    fn run_shell(&self, line: &str) -> Result<CommandOutput> {
        log::debug!("Executing via shell: {}", line);

        #[cfg(target_os = "windows")]
        let (program, mut command) = {
            use std::os::windows::process::CommandExt;
            let mut command = Command::new("cmd");
            // raw_arg keeps cmd.exe from seeing escaped quotes around adapter names
            command.raw_arg("/C").raw_arg(line);
            ("cmd", command)
        };

        #[cfg(not(target_os = "windows"))]
        let (program, mut command) = {
            let mut command = Command::new("sh");
            command.arg("-c").arg(line);
            ("sh", command)
        };

        capture(program, &mut command)
    }
}

fn capture(program: &str, command: &mut Command) -> Result<CommandOutput> {
    let output = command.output().map_err(|source| NatError::Spawn {
        program: program.to_string(),
        source,
    })?;

    Ok(CommandOutput {
        success: output.status.success(),
        status: output.status.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Check whether `program` can be found on PATH
pub fn program_available(program: &str) -> bool {
    let locator = if cfg!(target_os = "windows") {
        "where"
    } else {
        "which"
    };

    Command::new(locator)
        .arg(program)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Characters cmd.exe interprets outside double quotes
pub const CMD_METACHARACTERS: &[char] = &['&', '|', '^', '<', '>', '(', ')', '"', ','];

/// Quote a single token for a cmd.exe command line
///
/// Tokens with whitespace or cmd metacharacters are wrapped in double quotes.
/// A token can never carry a `"` of its own; callers reject those earlier.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty()
        || arg.contains(char::is_whitespace)
        || arg.contains(CMD_METACHARACTERS)
    {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

/// Render a program and its arguments as one command line
pub fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(quote_arg(program))
        .chain(args.iter().map(|a| quote_arg(a)))
        .collect::<Vec<_>>()
        .join(" ")
}
