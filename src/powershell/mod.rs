// PowerShell session and command batching
//
// Scripts run through `powershell -NoProfile -NonInteractive -Command`, one
// process per script. Output meant for parsing is piped through
// `format-list -Property *` and read back with the record parser.

pub mod record;

pub use record::{
    Access, FieldSpec, PowershellRecord, parse_row, parse_rows, to_powershell_string,
};

use crate::command::{CommandRunner, SystemCommandRunner, program_available};
use crate::error::{NatError, Result};

const POWERSHELL: &str = "powershell";
const BATCH_SEPARATOR: &str = ";";

/// Something that can run PowerShell scripts
pub trait PowershellShell: Send + Sync {
    /// Run `script`, returning (stdout, stderr)
    fn execute(&self, script: &str) -> Result<(String, String)>;
}

/// PowerShell on the local host
pub struct LocalPowershell {
    runner: Box<dyn CommandRunner>,
}

impl LocalPowershell {
    pub fn new() -> Self {
        Self::with_runner(Box::new(SystemCommandRunner))
    }

    pub fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn is_available() -> bool {
        program_available(POWERSHELL)
    }
}

impl Default for LocalPowershell {
    fn default() -> Self {
        Self::new()
    }
}

impl PowershellShell for LocalPowershell {
    fn execute(&self, script: &str) -> Result<(String, String)> {
        // Make non-terminating cmdlet errors fail the process
        let script = format!("$ErrorActionPreference = 'Stop'; {}", script);
        let args: Vec<String> = [
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let label = format!("{} -Command {}", POWERSHELL, script);
        let output = self.runner.run(POWERSHELL, &args)?.check(&label)?;

        if !output.stderr.trim().is_empty() {
            log::error!("{} wrote to stderr: {}", label, output.stderr.trim_end());
            return Err(NatError::CommandFailed {
                command: label,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok((output.stdout, output.stderr))
    }
}

/// Ordered queue of PowerShell commands bound to one shell
///
/// Not meant to be shared between threads.
pub struct PowershellBatch<'a> {
    shell: &'a dyn PowershellShell,
    commands: Vec<String>,
    executed: bool,
}

impl<'a> PowershellBatch<'a> {
    pub fn new(shell: &'a dyn PowershellShell) -> Self {
        Self {
            shell,
            commands: Vec::new(),
            executed: false,
        }
    }

    pub fn append(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Run each command in order, stopping at the first failure
    ///
    /// Returns the number of commands run. On failure the error carries how
    /// many completed before it.
    pub fn execute(&mut self) -> Result<usize> {
        self.executed = true;
        let total = self.commands.len();

        for (completed, command) in self.commands.iter().enumerate() {
            if let Err(e) = self.shell.execute(command) {
                return Err(NatError::BatchAborted {
                    completed,
                    total,
                    source: Box::new(e),
                });
            }
        }

        Ok(total)
    }

    /// Run every command in order, continuing past failures
    ///
    /// Returns the number of commands that succeeded, or the last error seen.
    pub fn execute_each(&mut self) -> Result<usize> {
        self.executed = true;
        let mut succeeded = 0;
        let mut last_error = None;

        for command in &self.commands {
            match self.shell.execute(command) {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    log::warn!("{}: {}", command, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(succeeded),
        }
    }

    /// Run every command in a single script joined with `;`
    pub fn execute_fast(&mut self) -> Result<()> {
        self.executed = true;
        if self.commands.is_empty() {
            return Ok(());
        }
        let script = self.commands.join(BATCH_SEPARATOR);
        self.shell.execute(&script).map(|_| ())
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn reset(&mut self) {
        self.commands.clear();
        self.executed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::RecordingRunner;

    fn script_of(call: &[String]) -> &str {
        call.last().map(String::as_str).unwrap_or_default()
    }

    #[test]
    fn test_local_powershell_arguments() {
        let runner = RecordingRunner::new(|_, _| Ok(CommandOutput::ok("done\r\n")));
        let shell = LocalPowershell::with_runner(Box::new(runner.clone()));
        let (stdout, stderr) = shell.execute("Get-NetNat").unwrap();
        assert_eq!(stdout, "done\r\n");
        assert!(stderr.is_empty());

        let calls = runner.calls();
        assert_eq!(calls[0][0], "powershell");
        assert_eq!(calls[0][1], "-NoProfile");
        assert_eq!(script_of(&calls[0]), "$ErrorActionPreference = 'Stop'; Get-NetNat");
    }

    #[test]
    fn test_local_powershell_stderr_is_error() {
        let runner = RecordingRunner::new(|_, _| {
            Ok(CommandOutput {
                stderr: "Get-NetNat : Access is denied.".to_string(),
                ..CommandOutput::ok("")
            })
        });
        let shell = LocalPowershell::with_runner(Box::new(runner));
        assert!(matches!(
            shell.execute("Get-NetNat"),
            Err(NatError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_batch_execute_stops_at_first_failure() {
        let runner = RecordingRunner::new(|_, args| {
            if args.last().is_some_and(|s| s.ends_with("fail")) {
                Ok(CommandOutput::failed(1, "", "boom"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        let shell = LocalPowershell::with_runner(Box::new(runner.clone()));
        let mut batch = PowershellBatch::new(&shell);
        batch.append("first");
        batch.append("fail");
        batch.append("never");
        assert_eq!(batch.len(), 3);

        let err = batch.execute().unwrap_err();
        assert!(matches!(err, NatError::BatchAborted { completed: 1, total: 3, .. }));
        assert!(batch.is_executed());
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_batch_execute_each_attempts_all_and_keeps_last_error() {
        let runner = RecordingRunner::new(|_, args| match args.last().map(String::as_str) {
            Some(s) if s.ends_with("first") => Ok(CommandOutput::failed(1, "", "one")),
            Some(s) if s.ends_with("third") => Ok(CommandOutput::failed(2, "", "three")),
            _ => Ok(CommandOutput::ok("")),
        });
        let shell = LocalPowershell::with_runner(Box::new(runner.clone()));
        let mut batch = PowershellBatch::new(&shell);
        batch.append("first");
        batch.append("second");
        batch.append("third");

        let err = batch.execute_each().unwrap_err();
        assert!(matches!(err, NatError::CommandFailed { ref stderr, .. } if stderr == "three"));
        assert_eq!(runner.calls().len(), 3);

        batch.reset();
        batch.append("second");
        assert_eq!(batch.execute_each().unwrap(), 1);
    }

    #[test]
    fn test_batch_execute_fast_joins_commands() {
        let runner = RecordingRunner::silent();
        let shell = LocalPowershell::with_runner(Box::new(runner.clone()));
        let mut batch = PowershellBatch::new(&shell);
        batch.append("a");
        batch.append("b");
        batch.execute_fast().unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(script_of(&calls[0]), "$ErrorActionPreference = 'Stop'; a;b");
    }

    #[test]
    fn test_batch_reset() {
        let runner = RecordingRunner::silent();
        let shell = LocalPowershell::with_runner(Box::new(runner.clone()));
        let mut batch = PowershellBatch::new(&shell);
        batch.append("a");
        assert_eq!(batch.execute().unwrap(), 1);
        batch.reset();
        assert!(!batch.is_executed());
        assert!(batch.is_empty());
        batch.execute_fast().unwrap();
        assert_eq!(runner.calls().len(), 1);
    }
}
