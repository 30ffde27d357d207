//! Operator confirmations.
//!
//! Business logic asks for approval through [`ConfirmationPort`] and never
//! prompts directly. [`TerminalConfirm`] prompts on the terminal;
//! [`AutoConfirm`] answers every prompt the same way for CI.

use std::io::IsTerminal;
use std::sync::Arc;

use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, Confirm, Input};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::error::RolloutError;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfirmationPort: Send + Sync {
    /// Whether a human is answering.
    fn is_interactive(&self) -> bool;

    /// Yes/no confirmation.
    async fn confirm(&self, prompt: &str) -> Result<bool, RolloutError>;

    /// Require the operator to type `expected` verbatim.
    async fn confirm_phrase(&self, prompt: &str, expected: &str) -> Result<bool, RolloutError>;
}

/// Interactive terminal prompts.
///
/// Only interactive while stdin is a terminal; without one every prompt is
/// refused instead of failing inside dialoguer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

/// Whether stdin is attached to a terminal.
#[must_use]
pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

#[async_trait]
impl ConfirmationPort for TerminalConfirm {
    fn is_interactive(&self) -> bool {
        stdin_is_terminal()
    }

    async fn confirm(&self, prompt: &str) -> Result<bool, RolloutError> {
        if !self.is_interactive() {
            info!(prompt, "No terminal attached, refusing confirmation");
            return Ok(false);
        }
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await
        .map_err(|e| RolloutError::Declined(format!("prompt aborted: {e}")))?
        .map_err(|e| RolloutError::Declined(format!("prompt failed: {e}")))
    }

    async fn confirm_phrase(&self, prompt: &str, expected: &str) -> Result<bool, RolloutError> {
        if !self.is_interactive() {
            info!(prompt, "No terminal attached, refusing confirmation");
            return Ok(false);
        }
        let prompt = prompt.to_string();
        let typed = tokio::task::spawn_blocking(move || {
            Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
        })
        .await
        .map_err(|e| RolloutError::Declined(format!("prompt aborted: {e}")))?
        .map_err(|e| RolloutError::Declined(format!("prompt failed: {e}")))?;
        Ok(typed.trim() == expected)
    }
}

/// Non-interactive mode: approve (`--yes`) or deny everything.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm {
    approve: bool,
}

impl AutoConfirm {
    #[must_use]
    pub fn approve() -> Self {
        Self { approve: true }
    }

    #[must_use]
    pub fn deny() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl ConfirmationPort for AutoConfirm {
    fn is_interactive(&self) -> bool {
        false
    }

    async fn confirm(&self, prompt: &str) -> Result<bool, RolloutError> {
        info!(prompt, approved = self.approve, "Non-interactive confirmation");
        Ok(self.approve)
    }

    async fn confirm_phrase(&self, prompt: &str, _expected: &str) -> Result<bool, RolloutError> {
        self.confirm(prompt).await
    }
}

/// The port for a CLI run: `--yes` approves everything, a terminal
/// prompts, and anything else (CI without `--yes`) denies.
#[must_use]
pub fn for_cli(assume_yes: bool, interactive: bool) -> Arc<dyn ConfirmationPort> {
    if assume_yes {
        Arc::new(AutoConfirm::approve())
    } else if interactive {
        Arc::new(TerminalConfirm)
    } else {
        Arc::new(AutoConfirm::deny())
    }
}

/// Ask and turn a refusal into [`RolloutError::Declined`].
///
/// # Errors
///
/// Returns `Declined` when the operator says no.
pub async fn require(port: &dyn ConfirmationPort, prompt: &str) -> Result<(), RolloutError> {
    if port.confirm(prompt).await? {
        Ok(())
    } else {
        Err(RolloutError::Declined(prompt.to_string()))
    }
}
