//! Expect/respond automaton for pseudo-terminal driven children
//!
//! A child process is driven lock-step: wait for one of a small set of
//! literal markers, answer it, repeat. The same loop runs the VPN login and
//! the sudo password prompt; only the [`Responder`] differs.
//!
//! Every way out of [`drive`] other than a clean end-of-stream leaves the
//! child interrupted and reaped, so nothing stays attached to a pty with no
//! reader.

pub mod login;
#[cfg(unix)]
pub mod pty;
pub mod sudo;

use crate::credentials::CredentialError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound for a single wait on the child's output
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(99);

#[derive(Error, Debug)]
pub enum ExpectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("Empty command")]
    EmptyCommand,
    #[error("Cancelled")]
    Cancelled,
    #[error("Password was the same as the previous attempt, not resubmitting")]
    AuthLockoutGuard,
    #[error("Sudo password was rejected")]
    SudoRejected,
    #[error("Credentials unavailable: {0}")]
    Credential(#[from] CredentialError),
}

/// What a wait on the child's output produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectEvent {
    /// Index into the marker list
    Matched(usize),
    Timeout,
    Eof,
}

/// A child process that can be driven through expect/respond steps.
pub trait Interactive {
    /// Wait until one of `markers` appears in the output, the timeout passes
    /// or the output ends. Returns `Err(Cancelled)` once `cancel` fires.
    fn expect(
        &mut self,
        markers: &[&str],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExpectEvent, ExpectError>;

    fn send_line(&mut self, line: &str) -> Result<(), ExpectError>;

    /// Ask the child to stop, as Ctrl-C on its terminal would.
    fn interrupt(&mut self) -> Result<(), ExpectError>;

    /// Wait for the child to exit; `None` when no exit code is available.
    fn wait(&mut self) -> Result<Option<i32>, ExpectError>;

    /// Retained output lines, with credential echo removed
    fn transcript(&self) -> &[String];
}

/// Cooperative cancellation flag shared with the Ctrl-C handler
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ExpectError> {
        if self.is_cancelled() {
            Err(ExpectError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Reply chosen by a [`Responder`] for a matched marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    Continue,
    Finish,
}

pub trait Responder {
    fn markers(&self) -> &'static [&'static str];

    /// React to `markers()[index]`. An error aborts the child.
    fn respond(&mut self, index: usize) -> Result<Action, ExpectError>;
}

/// How a driven child ended when no fault occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The responder reached its success marker; the child may still run.
    Finished,
    /// Output ended; carries the child's exit code.
    Exited(Option<i32>),
    /// No marker within the timeout; the child was interrupted.
    TimedOut(Option<i32>),
}

/// Run the expect/respond loop until the responder finishes, the child
/// ends, or a wait times out.
pub fn drive(
    process: &mut dyn Interactive,
    responder: &mut dyn Responder,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Outcome, ExpectError> {
    match run_loop(process, responder, timeout, cancel) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            debug!("Aborting child: {}", e);
            abort(process);
            Err(e)
        }
    }
}

fn run_loop(
    process: &mut dyn Interactive,
    responder: &mut dyn Responder,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Outcome, ExpectError> {
    loop {
        match process.expect(responder.markers(), timeout, cancel)? {
            ExpectEvent::Matched(index) => match responder.respond(index)? {
                Action::Send(text) => process.send_line(&text)?,
                Action::Continue => {}
                Action::Finish => return Ok(Outcome::Finished),
            },
            ExpectEvent::Eof => return Ok(Outcome::Exited(process.wait()?)),
            ExpectEvent::Timeout => {
                warn!("No response within {}s, interrupting", timeout.as_secs());
                process.interrupt()?;
                return Ok(Outcome::TimedOut(process.wait()?));
            }
        }
    }
}

fn abort(process: &mut dyn Interactive) {
    if let Err(e) = process.interrupt() {
        warn!("Failed to interrupt child: {}", e);
    }
    match process.wait() {
        Ok(code) => debug!("Child exited with {:?}", code),
        Err(e) => warn!("Failed to reap child: {}", e),
    }
}

/// Where a line of child output may go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Shown to the operator and kept in the transcript
    Keep,
    /// Shown to the operator only
    ShowOnly,
    /// Discarded
    Drop,
}

/// Keeps credential echo out of transcripts: a prompt line is shown but not
/// retained, and the line after it is discarded.
#[derive(Debug, Clone, Default)]
pub struct TranscriptFilter {
    prompts: Vec<String>,
    pending: usize,
}

impl TranscriptFilter {
    pub fn new<I, S>(prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prompts: prompts.into_iter().map(Into::into).collect(),
            pending: 0,
        }
    }

    pub fn feed(&mut self, line: &str) -> Disposition {
        let trimmed = line.trim_start();
        if self.prompts.iter().any(|p| trimmed.starts_with(p.as_str())) {
            self.pending += 1;
            return Disposition::ShowOnly;
        }
        if self.pending > 0 {
            self.pending -= 1;
            return Disposition::Drop;
        }
        Disposition::Keep
    }
}

/// Earliest marker occurrence in `text` as (marker index, end offset).
/// Ties go to the marker listed first.
pub(crate) fn find_marker(text: &str, markers: &[&str]) -> Option<(usize, usize)> {
    markers
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_empty())
        .filter_map(|(i, m)| text.find(m).map(|pos| (pos, i, pos + m.len())))
        .min_by_key(|&(pos, i, _)| (pos, i))
        .map(|(_, i, end)| (i, end))
}
