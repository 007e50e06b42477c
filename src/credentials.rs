//! Per-session credential sources
//!
//! Nothing here is process-global: each session owns its own sources, and the
//! sudo password is cached only inside the [`SudoPassword`] it was read into.

use crate::config::{ConfigError, SessionSettings, resolve_secret};
use std::cell::RefCell;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to read password: {0}")]
    Prompt(#[from] std::io::Error),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("No more credentials available")]
    Exhausted,
}

/// Supplies the VPN login answers.
pub trait CredentialSource {
    fn username(&self) -> Result<String, CredentialError>;

    /// Called once per `Password:` prompt; may prompt the operator.
    fn password(&self) -> Result<String, CredentialError>;
}

/// Credentials from a session profile, prompting when no password is set
pub struct ConfiguredCredentials {
    username: String,
    password: Option<String>,
}

impl ConfiguredCredentials {
    pub fn new(username: String, password: Option<String>) -> Self {
        Self { username, password }
    }

    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self::new(settings.username.clone(), settings.password.clone())
    }
}

impl CredentialSource for ConfiguredCredentials {
    fn username(&self) -> Result<String, CredentialError> {
        Ok(resolve_secret(&self.username)?)
    }

    fn password(&self) -> Result<String, CredentialError> {
        match &self.password {
            Some(value) => Ok(resolve_secret(value)?),
            // The child already printed its own prompt
            None => Ok(rpassword::prompt_password("")?),
        }
    }
}

/// Sudo password, read at most once per session unless sudo rejects it
#[derive(Debug, Default)]
pub struct SudoPassword {
    configured: Option<String>,
    cached: RefCell<Option<String>>,
}

impl SudoPassword {
    pub fn new(configured: Option<String>) -> Self {
        Self {
            configured: configured.filter(|v| !v.is_empty()),
            cached: RefCell::new(None),
        }
    }

    pub fn get(&self) -> Result<String, CredentialError> {
        if let Some(password) = self.cached.borrow().as_ref() {
            return Ok(password.clone());
        }
        let password = match &self.configured {
            Some(value) => resolve_secret(value)?,
            None => rpassword::prompt_password("Enter sudo password: ")?,
        };
        *self.cached.borrow_mut() = Some(password.clone());
        Ok(password)
    }

    /// Drop the cached value so the next request asks again.
    pub fn forget(&self) {
        self.cached.borrow_mut().take();
    }
}
