use std::fmt;
use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use serde::Serialize;

use crate::domain::ScratchRoot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "root", rename_all = "snake_case")]
pub enum DestructiveAction {
    EraseScratch,
    Erase(ScratchRoot),
    Clean(ScratchRoot),
    DeleteArchives,
}

impl fmt::Display for DestructiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestructiveAction::EraseScratch => write!(f, "erase 'scratch/'"),
            DestructiveAction::Erase(root) => write!(f, "erase the '{root}/' folder"),
            DestructiveAction::Clean(root) => write!(f, "clean files in '{root}/'"),
            DestructiveAction::DeleteArchives => write!(f, "delete intermediate ZIP files"),
        }
    }
}

/// Proof that the user agreed to one destructive action. Only a
/// [`Confirm`] implementation in this module can mint one.
#[derive(Debug, PartialEq, Eq)]
pub struct ConfirmationToken {
    action: DestructiveAction,
}

impl ConfirmationToken {
    fn grant(action: DestructiveAction) -> Self {
        Self { action }
    }

    pub fn action(&self) -> DestructiveAction {
        self.action
    }

    pub fn authorizes(&self, action: DestructiveAction) -> bool {
        self.action == action
    }
}

pub trait Confirm {
    /// `None` means the user declined.
    fn confirm(&self, action: DestructiveAction) -> Option<ConfirmationToken>;
}

/// Asks on the terminal, one key press: `y` confirms, anything else declines.
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, action: DestructiveAction) -> Option<ConfirmationToken> {
        match ask(&format!("Are you sure you want to {action}? [y/N] ")) {
            Ok(true) => Some(ConfirmationToken::grant(action)),
            Ok(false) => None,
            Err(err) => {
                tracing::warn!(%action, error = %err, "confirmation prompt failed, declining");
                None
            }
        }
    }
}

fn ask(prompt: &str) -> io::Result<bool> {
    let mut stdout = io::stdout();
    stdout.write_all(prompt.as_bytes())?;
    stdout.flush()?;

    enable_raw_mode()?;
    let answer = loop {
        match event::read() {
            Ok(Event::Key(KeyEvent {
                code,
                kind: KeyEventKind::Press,
                ..
            })) => match code {
                KeyCode::Char('y') | KeyCode::Char('Y') => break Ok(true),
                KeyCode::Char(_) | KeyCode::Enter | KeyCode::Esc => break Ok(false),
                _ => {}
            },
            Ok(_) => {}
            Err(err) => break Err(err),
        }
    };
    disable_raw_mode()?;

    let answer = answer?;
    stdout.write_all(if answer { b"y\r\n" } else { b"n\r\n" })?;
    stdout.flush()?;
    Ok(answer)
}

/// Grants every request (`--yes`).
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, action: DestructiveAction) -> Option<ConfirmationToken> {
        Some(ConfirmationToken::grant(action))
    }
}

/// Declines every request; used when no terminal is available.
pub struct AlwaysDecline;

impl Confirm for AlwaysDecline {
    fn confirm(&self, _action: DestructiveAction) -> Option<ConfirmationToken> {
        None
    }
}
