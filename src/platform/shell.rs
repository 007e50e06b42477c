//! Host command execution, elevated through sudo when asked
//!
//! Commands run on a pty so sudo's password prompt can be answered by the
//! same expect loop that drives the VPN login. The password never shows up
//! in the captured output.

use super::PlatformError;
use crate::credentials::SudoPassword;
use crate::expect::pty::{PtyProcess, SpawnOptions};
use crate::expect::sudo::{SUDO_PROMPT, SudoResponder};
use crate::expect::{CancelToken, ExpectError, Interactive, Outcome, drive};
use std::time::Duration;
use tracing::{error, info};

/// Per-wait timeout for host commands
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs host commands on behalf of a network backend.
pub trait HostShell {
    /// Run `argv`; a leading `sudo` elevates the rest.
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput, PlatformError>;

    /// Like [`HostShell::run`], but a non-zero exit is reported with the
    /// captured output and returned as an error.
    fn run_checked(&mut self, argv: &[String]) -> Result<CommandOutput, PlatformError> {
        let output = self.run(argv)?;
        if !output.success() {
            error!("Error running: {}", display_command(argv));
            for line in &output.lines {
                error!("  {}", line);
            }
        }
        ensure_success(argv, output)
    }
}

/// Turn a non-zero exit into [`PlatformError::CommandFailed`] without logging.
pub fn ensure_success(argv: &[String], output: CommandOutput) -> Result<CommandOutput, PlatformError> {
    if output.success() {
        Ok(output)
    } else {
        Err(PlatformError::CommandFailed {
            command: display_command(argv),
            status: output.status,
            output: output.lines.join("\n"),
        })
    }
}

/// Build an argv from string slices.
pub fn argv<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

/// Render a command line for logs, quoting arguments with spaces or quotes.
pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.contains('"') || arg.contains(' ') || arg.is_empty() {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Host shell backed by a pty, answering sudo prompts from the session's
/// [`SudoPassword`].
pub struct PtyShell {
    sudo: SudoPassword,
    cancel: CancelToken,
    timeout: Duration,
}

impl PtyShell {
    pub fn new(sudo: SudoPassword, cancel: CancelToken) -> Self {
        Self {
            sudo,
            cancel,
            timeout: COMMAND_TIMEOUT,
        }
    }

    fn elevate(argv: &[String]) -> Vec<String> {
        match argv.split_first() {
            Some((first, rest)) if first == "sudo" => {
                let mut elevated = argv_sudo();
                elevated.extend(rest.iter().cloned());
                elevated
            }
            _ => argv.to_vec(),
        }
    }
}

fn argv_sudo() -> Vec<String> {
    argv(["sudo", "-S", "-p", SUDO_PROMPT])
}

impl HostShell for PtyShell {
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput, PlatformError> {
        info!("> {}", display_command(argv));
        let full = Self::elevate(argv);

        let options = SpawnOptions {
            env: Vec::new(),
            echo: false,
            prompts: vec![SUDO_PROMPT.to_string()],
        };
        let mut process = PtyProcess::spawn(&full, options)?;
        let mut responder = SudoResponder::new(&self.sudo);
        let outcome = drive(&mut process, &mut responder, self.timeout, &self.cancel);

        let status = match outcome {
            Ok(Outcome::Exited(status)) => status,
            Ok(Outcome::TimedOut(_)) => {
                return Err(PlatformError::CommandTimedOut(display_command(argv)));
            }
            Ok(Outcome::Finished) => None,
            Err(ExpectError::SudoRejected) => {
                error!("Sudo password was wrong");
                return Err(ExpectError::SudoRejected.into());
            }
            Err(e) => return Err(e.into()),
        };

        let lines = process
            .transcript()
            .iter()
            .skip_while(|line| line.trim().is_empty())
            .cloned()
            .collect();
        Ok(CommandOutput { status, lines })
    }
}
