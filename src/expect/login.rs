//! VPN login negotiation

use super::{Action, CancelToken, ExpectError, Interactive, Outcome, Responder, drive};
use crate::credentials::CredentialSource;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

pub const USERNAME_PROMPT: &str = "Username:";
pub const PASSWORD_PROMPT: &str = "Password:";
pub const ESTABLISHED: &str = "Established";
pub const LOGIN_FAILED: &str = "Login failed.";

const MARKERS: &[&str] = &[USERNAME_PROMPT, PASSWORD_PROMPT, ESTABLISHED, LOGIN_FAILED];

/// Prompts whose following line must never be retained
pub const CREDENTIAL_PROMPTS: &[&str] = &[USERNAME_PROMPT, PASSWORD_PROMPT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    AwaitingUsername,
    AwaitingPassword,
    Established,
    LoginFailed,
    TimedOut,
    Cancelled,
}

impl LoginState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoginState::Established | LoginState::TimedOut | LoginState::Cancelled
        )
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginState::AwaitingUsername => "awaiting username",
            LoginState::AwaitingPassword => "awaiting password",
            LoginState::Established => "established",
            LoginState::LoginFailed => "login failed",
            LoginState::TimedOut => "timed out",
            LoginState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of a login attempt that did not fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Established,
    /// The child ended or stalled before establishing. `state` is where the
    /// login stopped, `TimedOut` for a stall.
    Failed {
        exit_code: Option<i32>,
        state: LoginState,
    },
}

pub struct LoginResponder<'a> {
    credentials: &'a dyn CredentialSource,
    state: LoginState,
    last_password: Option<String>,
}

impl<'a> LoginResponder<'a> {
    pub fn new(credentials: &'a dyn CredentialSource) -> Self {
        Self {
            credentials,
            state: LoginState::AwaitingUsername,
            last_password: None,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Drive `process` until the tunnel is established. The final state stays
    /// readable afterwards, including `Cancelled` when `cancel` fired.
    pub fn run(
        &mut self,
        process: &mut dyn Interactive,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<LoginOutcome, ExpectError> {
        match drive(process, self, timeout, cancel) {
            Ok(Outcome::Finished) => {
                info!("VPN session established");
                Ok(LoginOutcome::Established)
            }
            Ok(Outcome::Exited(exit_code)) => {
                warn!(
                    "Login ended while {} (exit code {:?})",
                    self.state, exit_code
                );
                Ok(LoginOutcome::Failed {
                    exit_code,
                    state: self.state,
                })
            }
            Ok(Outcome::TimedOut(exit_code)) => {
                warn!("Login timed out while {}", self.state);
                self.state = LoginState::TimedOut;
                Ok(LoginOutcome::Failed {
                    exit_code,
                    state: self.state,
                })
            }
            Err(ExpectError::Cancelled) => {
                warn!("Login cancelled while {}", self.state);
                self.state = LoginState::Cancelled;
                Err(ExpectError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }
}

impl Responder for LoginResponder<'_> {
    fn markers(&self) -> &'static [&'static str] {
        MARKERS
    }

    fn respond(&mut self, index: usize) -> Result<Action, ExpectError> {
        match MARKERS.get(index).copied() {
            Some(USERNAME_PROMPT) => {
                let username = self.credentials.username()?;
                self.state = LoginState::AwaitingPassword;
                Ok(Action::Send(username))
            }
            Some(PASSWORD_PROMPT) => {
                let password = self.credentials.password()?;
                // Resubmitting a rejected password only burns lockout attempts
                if self.last_password.as_deref() == Some(password.as_str()) {
                    warn!("Password was the same as the previous attempt");
                    return Err(ExpectError::AuthLockoutGuard);
                }
                self.last_password = Some(password.clone());
                self.state = LoginState::AwaitingPassword;
                Ok(Action::Send(password))
            }
            Some(ESTABLISHED) => {
                self.state = LoginState::Established;
                Ok(Action::Finish)
            }
            Some(LOGIN_FAILED) => {
                info!("Login failed, waiting for the server to prompt again");
                self.state = LoginState::LoginFailed;
                Ok(Action::Continue)
            }
            _ => Ok(Action::Continue),
        }
    }
}

/// Drive a login over `process` until the tunnel is established.
pub fn negotiate(
    process: &mut dyn Interactive,
    credentials: &dyn CredentialSource,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<LoginOutcome, ExpectError> {
    LoginResponder::new(credentials).run(process, timeout, cancel)
}
