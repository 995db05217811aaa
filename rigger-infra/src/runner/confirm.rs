//! Interactive approval

use parking_lot::Mutex;
use tracing::warn;

pub trait Confirm: Send + Sync {
    fn confirm(&self, message: &str, default_yes: bool) -> bool;
}

/// Asks on the terminal. Any terminal error counts as a refusal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialoguerConfirm;

impl Confirm for DialoguerConfirm {
    fn confirm(&self, message: &str, default_yes: bool) -> bool {
        match dialoguer::Confirm::new()
            .with_prompt(message)
            .default(default_yes)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Confirmation failed: {}", e);
                false
            }
        }
    }
}

/// Always gives the same answer and records what it was asked.
#[derive(Debug, Default)]
pub struct StaticConfirm {
    answer: bool,
    asked: Mutex<Vec<String>>,
}

impl StaticConfirm {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

impl Confirm for StaticConfirm {
    fn confirm(&self, message: &str, _default_yes: bool) -> bool {
        self.asked.lock().push(message.to_string());
        self.answer
    }
}
