//! Confirmation for destructive lifecycle operations

use std::io::{self, BufRead, Write};

/// Asked once before an overwrite-install or a rollback
#[cfg_attr(test, mockall::automock)]
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Fixed answer, used for `--yes` and in tests
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

/// Interactive y/N prompt on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{} [y/N]: ", prompt);
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        match io::stdin().lock().read_line(&mut input) {
            Ok(_) => matches!(input.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}
