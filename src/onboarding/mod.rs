//! Agent onboarding automation.
//!
//! Drives a CLI agent's first-run interactive dialog to completion: reads
//! the child's terminal output, classifies the current screen, advances it
//! with keystrokes, surfaces the OAuth URL, and accepts the user's code.
//! Humans only ever see [`OnboardingStatus`]; terminal scraping stays
//! internal.

pub mod driver;
pub mod pty;
pub mod screen;

pub use driver::OnboardingDriver;
pub use pty::{OwnedPty, PtyWriter};
pub use screen::{extract_oauth_url, strip_escape_sequences};

use serde::{Deserialize, Serialize};

/// Screens of the onboarding dialog, plus the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingState {
    Idle,
    ThemeSelect,
    AuthMethod,
    AuthWaiting,
    AuthConfirm,
    BypassPermissions,
    SecurityNotes,
    TerminalSetup,
    Complete,
    Error,
}

impl OnboardingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OnboardingState::Complete | OnboardingState::Error)
    }

    /// States that wait on the human (or are final) never auto-advance.
    pub fn auto_advances(self) -> bool {
        !matches!(
            self,
            OnboardingState::AuthWaiting | OnboardingState::Complete | OnboardingState::Error
        )
    }
}

/// Status snapshot consumed by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingStatus {
    pub state: OnboardingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_url: Option<String>,
    /// Per-state human description.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Tail of the rolling output buffer.
    pub output: String,
}

/// Human description of each state. These strings are user-facing and never
/// reference internals.
pub fn state_message(state: OnboardingState) -> &'static str {
    match state {
        OnboardingState::Idle => "Starting the agent...",
        OnboardingState::ThemeSelect => "Configuring appearance...",
        OnboardingState::AuthMethod => "Selecting login method...",
        OnboardingState::AuthWaiting => {
            "Open the authorization link, then paste the code you receive."
        }
        OnboardingState::AuthConfirm => "Confirming login...",
        OnboardingState::BypassPermissions => "Configuring permissions...",
        OnboardingState::SecurityNotes => "Reviewing setup notes...",
        OnboardingState::TerminalSetup => "Finishing terminal setup...",
        OnboardingState::Complete => "Authentication complete.",
        OnboardingState::Error => "Authentication could not be completed.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(OnboardingState::Complete.is_terminal());
        assert!(OnboardingState::Error.is_terminal());
        assert!(!OnboardingState::AuthWaiting.is_terminal());
    }

    #[test]
    fn auth_waiting_never_auto_advances() {
        assert!(!OnboardingState::AuthWaiting.auto_advances());
        assert!(!OnboardingState::Complete.auto_advances());
        assert!(OnboardingState::ThemeSelect.auto_advances());
        assert!(OnboardingState::BypassPermissions.auto_advances());
    }

    #[test]
    fn state_messages_are_clean() {
        for state in [
            OnboardingState::Idle,
            OnboardingState::ThemeSelect,
            OnboardingState::AuthMethod,
            OnboardingState::AuthWaiting,
            OnboardingState::AuthConfirm,
            OnboardingState::BypassPermissions,
            OnboardingState::SecurityNotes,
            OnboardingState::TerminalSetup,
            OnboardingState::Complete,
            OnboardingState::Error,
        ] {
            let message = state_message(state);
            assert!(!message.contains("PTY"));
            assert!(!message.contains("State"));
        }
    }
}
