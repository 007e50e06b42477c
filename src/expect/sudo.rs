//! Single-prompt responder for `sudo -S -p <prompt>`

use super::{Action, ExpectError, Responder};
use crate::credentials::SudoPassword;

/// Prompt passed to `sudo -p`; distinctive so command output never matches.
pub const SUDO_PROMPT: &str = "SUDO PASSWORD: ";

const MARKERS: &[&str] = &[SUDO_PROMPT];

pub struct SudoResponder<'a> {
    password: &'a SudoPassword,
    asked: bool,
}

impl<'a> SudoResponder<'a> {
    pub fn new(password: &'a SudoPassword) -> Self {
        Self {
            password,
            asked: false,
        }
    }
}

impl Responder for SudoResponder<'_> {
    fn markers(&self) -> &'static [&'static str] {
        MARKERS
    }

    fn respond(&mut self, _index: usize) -> Result<Action, ExpectError> {
        // sudo only asks again when the previous answer was wrong
        if self.asked {
            self.password.forget();
            return Err(ExpectError::SudoRejected);
        }
        self.asked = true;
        Ok(Action::Send(self.password.get()?))
    }
}
