//! Terminal screen classification.
//!
//! The agent's onboarding dialog is recognized purely from its text, after
//! terminal escape sequences are stripped. Detection runs highest-priority
//! first so that a screen carrying several cues (the error screen shares
//! the "Paste code here" cue with the auth prompt) resolves correctly.

use once_cell::sync::Lazy;
use regex::Regex;

use super::OnboardingState;

// Matches up to whitespace or an escape introducer, so styled output does
// not bleed into the captured URL.
static OAUTH_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://claude\.ai/oauth/authorize\?[^\s\x1b]+").expect("valid regex")
});

/// Extract the OAuth authorization URL from raw (un-stripped) output.
pub fn extract_oauth_url(raw: &str) -> Option<String> {
    OAUTH_URL_RE.find(raw).map(|m| {
        // Trailing quote or bracket artifacts from hyperlink escapes.
        m.as_str()
            .trim_end_matches(['"', '\'', ')', ']', '\u{7}'])
            .to_string()
    })
}

/// Strip terminal escape sequences: CSI (`ESC [ ... letter`), OSC
/// (`ESC ] ... BEL` or `ESC ] ... ESC \`), and the short `ESC >` / `ESC <`
/// forms.
pub fn strip_escape_sequences(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1b {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        // At an ESC; decide the sequence form.
        match bytes.get(i + 1) {
            Some(b'[') => {
                // CSI: parameters then a final byte in 0x40..=0x7e.
                i += 2;
                while i < bytes.len() && !(0x40..=0x7e).contains(&bytes[i]) {
                    i += 1;
                }
                i += 1; // consume the final byte
            }
            Some(b']') => {
                // OSC: terminated by BEL or ST (ESC \).
                i += 2;
                while i < bytes.len() {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            Some(b'>') | Some(b'<') => i += 2,
            Some(_) => i += 2,
            None => i += 1,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A recoverable authentication error recognized on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryableError {
    /// User-facing message; never raw terminal text.
    pub message: String,
    /// The screen offers "Press Enter to retry".
    pub wants_enter: bool,
}

/// What a screen classifies as.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreenDetection {
    State(OnboardingState),
    Error(RetryableError),
}

/// Classify a stripped screen. First match wins; the order is the priority.
pub fn detect_screen(clean: &str) -> Option<ScreenDetection> {
    use OnboardingState::*;

    // A settled shell prompt means onboarding already finished.
    if clean.contains("? for shortcuts") || clean.contains("Welcome back") {
        return Some(ScreenDetection::State(Complete));
    }
    if clean.contains("terminal setup") || clean.contains("Terminal setup") {
        return Some(ScreenDetection::State(TerminalSetup));
    }
    if clean.contains("Bypass Permissions") || clean.contains("bypass permissions") {
        return Some(ScreenDetection::State(BypassPermissions));
    }
    if clean.contains("Security notes") {
        return Some(ScreenDetection::State(SecurityNotes));
    }
    if clean.contains("Login successful") {
        return Some(ScreenDetection::State(AuthConfirm));
    }
    // The error screen shares the "Paste code here" cue, so it must be
    // checked before the auth prompt.
    if let Some(error) = detect_retryable_error(clean) {
        return Some(ScreenDetection::Error(error));
    }
    if clean.contains("Paste code here") {
        return Some(ScreenDetection::State(AuthWaiting));
    }
    if clean.contains("Select login method") || clean.contains("login method") {
        return Some(ScreenDetection::State(AuthMethod));
    }
    if clean.contains("Choose the text style") || clean.contains("Dark mode") {
        return Some(ScreenDetection::State(ThemeSelect));
    }
    None
}

fn detect_retryable_error(clean: &str) -> Option<RetryableError> {
    let wants_enter = clean.contains("Press Enter to retry");
    if clean.contains("Invalid code") || clean.contains("invalid code") {
        return Some(RetryableError {
            message: "Invalid authentication code. Please verify you copied the entire code."
                .to_string(),
            wants_enter,
        });
    }
    if clean.contains("unable to connect") || clean.contains("Connection error") {
        return Some(RetryableError {
            message: "Could not reach the authentication service. Please check your connection and retry."
                .to_string(),
            wants_enter,
        });
    }
    if clean.contains("OAuth error") || clean.contains("authorization failed") {
        return Some(RetryableError {
            message: "Authorization failed. Please request a new code and try again.".to_string(),
            wants_enter,
        });
    }
    None
}
