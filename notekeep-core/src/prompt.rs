//! Hooks through which the engine asks the user for decisions.
//!
//! Presentation is a collaborator concern: the CLI implements these over
//! the console, tests script them. The engine only calls and awaits.

use async_trait::async_trait;

/// Outcome of a conflict prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Keep the local copy.
    Local,
    /// Adopt the remote copy.
    Remote,
    /// Concatenate both copies with a timestamped separator.
    Merge,
}

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask for the session password. `None` means the user declined.
    async fn prompt_password(&self) -> Option<String>;

    /// Present both sides of a genuine conflict and await a decision.
    async fn prompt_conflict(&self, local_preview: &str, remote_preview: &str) -> ConflictChoice;
}
