//! The onboarding state machine.
//!
//! Three cooperative tasks share one status mutex: a reader draining PTY
//! output chunks, a 100 ms flush tick that writes pending keystrokes, and a
//! 1 Hz timeout enforcer. No I/O ever happens while the status mutex is
//! held; keystrokes are queued under the lock and written by the flush tick
//! through a separate writer handle.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::CommandBuilder;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::pty::{OwnedPty, PtyWriter};
use super::screen::{detect_screen, extract_oauth_url, strip_escape_sequences, ScreenDetection};
use super::{state_message, OnboardingState, OnboardingStatus};

/// Rolling output buffer size.
const BUFFER_CAP: usize = 8 * 1024;

/// Pause after a transition so UI consumers can observe it before the
/// screen is advanced.
const ADVANCE_GRACE: Duration = Duration::from_millis(300);

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Gap between the "2" keystroke and its confirming return on the
/// bypass-permissions screen.
const BYPASS_KEY_SPACING: Duration = Duration::from_millis(200);

/// Gap between the pasted code and its confirming return.
const CODE_RETURN_DELAY: Duration = Duration::from_millis(100);

/// Humans are slow; the code prompt waits much longer than UI screens.
const AUTH_WAITING_TIMEOUT: Duration = Duration::from_secs(180);
const STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Recovery returns sent before a state is declared stuck.
const MAX_RECOVERY_ATTEMPTS: u32 = 2;

const RECOVERY_FAILED_MESSAGE: &str =
    "Unable to complete authentication automatically. Please run the agent directly in your terminal to authenticate.";

const WRITE_FAILED_MESSAGE: &str =
    "Unable to send input to the agent. Please restart onboarding.";

struct PendingWrite {
    bytes: Vec<u8>,
    not_before: Instant,
}

struct DriverState {
    state: OnboardingState,
    buffer: Vec<u8>,
    oauth_url: Option<String>,
    error_message: Option<String>,
    code_submitted: bool,
    pending: VecDeque<PendingWrite>,
    entered_at: Instant,
    /// Keyed by state and counted cumulatively: a state entered, left, and
    /// re-entered keeps its earlier attempts.
    recovery_attempts: HashMap<OnboardingState, u32>,
}

type SessionsChangedHook = Arc<dyn Fn() + Send + Sync>;

struct DriverInner {
    status: Mutex<DriverState>,
    writer: Mutex<Box<dyn PtyWriter>>,
    owns_pty: bool,
    on_sessions_changed: Option<SessionsChangedHook>,
    stop_tx: watch::Sender<bool>,
}

pub struct OnboardingDriver {
    inner: Arc<DriverInner>,
}

impl OnboardingDriver {
    /// Spawn the agent in a fresh PTY owned by the driver.
    pub fn spawn(
        cmd: CommandBuilder,
        on_sessions_changed: Option<SessionsChangedHook>,
    ) -> anyhow::Result<Self> {
        let (pty, chunks) = OwnedPty::spawn(cmd, 24, 80)?;
        Ok(Self::start(
            Box::new(pty),
            chunks,
            true,
            None,
            on_sessions_changed,
        ))
    }

    /// Attach to a PTY the caller already owns. The driver never tears an
    /// attached PTY down; a same-size resize nudge forces a redraw so the
    /// current screen can be classified.
    pub fn attach(
        writer: Box<dyn PtyWriter>,
        chunks: mpsc::Receiver<Vec<u8>>,
        rows: u16,
        cols: u16,
        on_sessions_changed: Option<SessionsChangedHook>,
    ) -> Self {
        Self::start(writer, chunks, false, Some((rows, cols)), on_sessions_changed)
    }

    fn start(
        writer: Box<dyn PtyWriter>,
        mut chunks: mpsc::Receiver<Vec<u8>>,
        owns_pty: bool,
        nudge: Option<(u16, u16)>,
        on_sessions_changed: Option<SessionsChangedHook>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(DriverInner {
            status: Mutex::new(DriverState {
                state: OnboardingState::Idle,
                buffer: Vec::new(),
                oauth_url: None,
                error_message: None,
                code_submitted: false,
                pending: VecDeque::new(),
                entered_at: Instant::now(),
                recovery_attempts: HashMap::new(),
            }),
            writer: Mutex::new(writer),
            owns_pty,
            on_sessions_changed,
            stop_tx,
        });

        if let Some((rows, cols)) = nudge {
            if let Err(e) = inner.writer.lock().unwrap().resize(rows, cols) {
                warn!("redraw nudge failed: {e}");
            }
        }

        // Reader task: drain output chunks into detection.
        let reader = Arc::clone(&inner);
        let mut stop_rx = inner.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    chunk = chunks.recv() => match chunk {
                        Some(chunk) => DriverInner::ingest(&reader, &chunk),
                        None => break,
                    }
                }
            }
        });

        // Flush task: write at most one pending keystroke per tick.
        let flusher = Arc::clone(&inner);
        let mut stop_rx = inner.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => flusher.flush_pending(),
                }
            }
        });

        // Timeout task: 1 Hz state-age enforcement.
        let enforcer = Arc::clone(&inner);
        let mut stop_rx = inner.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => enforcer.check_timeout(),
                }
            }
        });

        Self { inner }
    }

    pub fn status(&self) -> OnboardingStatus {
        let st = self.inner.status.lock().unwrap();
        OnboardingStatus {
            state: st.state,
            oauth_url: st.oauth_url.clone(),
            message: state_message(st.state).to_string(),
            error_message: st.error_message.clone(),
            output: String::from_utf8_lossy(&st.buffer).into_owned(),
        }
    }

    pub fn code_submitted(&self) -> bool {
        self.inner.status.lock().unwrap().code_submitted
    }

    /// Accept the user's authorization code. Only valid while the dialog is
    /// waiting for one; the actual write happens on the next flush tick,
    /// with the confirming return ~100 ms behind the code.
    pub fn submit_code(&self, code: &str) -> Result<()> {
        let mut st = self.inner.status.lock().unwrap();
        if st.state != OnboardingState::AuthWaiting {
            return Err(Error::Onboarding(
                "Authentication is not waiting for a code right now.".to_string(),
            ));
        }
        st.error_message = None;
        st.code_submitted = true;
        let now = Instant::now();
        st.pending.push_back(PendingWrite {
            bytes: code.as_bytes().to_vec(),
            not_before: now,
        });
        st.pending.push_back(PendingWrite {
            bytes: b"\r".to_vec(),
            not_before: now + CODE_RETURN_DELAY,
        });
        Ok(())
    }

    /// Stop all tasks. PTYs owned by the driver are torn down; attached
    /// PTYs are left untouched. Idempotent.
    pub fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
        if self.inner.owns_pty {
            self.inner.writer.lock().unwrap().shutdown();
        }
    }
}

impl DriverInner {
    /// Process one chunk of PTY output: roll the buffer, harvest the OAuth
    /// URL from the raw bytes, classify the stripped screen, and act on a
    /// transition.
    fn ingest(self: &Arc<Self>, chunk: &[u8]) {
        let transition = {
            let mut st = self.status.lock().unwrap();
            st.buffer.extend_from_slice(chunk);
            if st.buffer.len() > BUFFER_CAP {
                let excess = st.buffer.len() - BUFFER_CAP;
                st.buffer.drain(..excess);
            }

            let raw = String::from_utf8_lossy(&st.buffer).into_owned();
            if st.oauth_url.is_none() {
                if let Some(url) = extract_oauth_url(&raw) {
                    debug!("captured OAuth URL");
                    st.oauth_url = Some(url);
                }
            }

            let clean = strip_escape_sequences(&raw);
            match detect_screen(&clean) {
                None => None,
                Some(ScreenDetection::Error(error)) => {
                    // Retryable: surface the message, let the user resubmit,
                    // and stay on the code prompt.
                    debug!("retryable onboarding error: {}", error.message);
                    st.error_message = Some(error.message);
                    st.code_submitted = false;
                    if st.state != OnboardingState::AuthWaiting {
                        st.state = OnboardingState::AuthWaiting;
                        st.entered_at = Instant::now();
                    }
                    if error.wants_enter {
                        let now = Instant::now();
                        st.pending.push_back(PendingWrite {
                            bytes: b"\r".to_vec(),
                            not_before: now,
                        });
                    }
                    None
                }
                Some(ScreenDetection::State(new_state)) if new_state != st.state => {
                    debug!("onboarding screen: {:?} -> {:?}", st.state, new_state);
                    st.state = new_state;
                    st.entered_at = Instant::now();
                    Some(new_state)
                }
                Some(ScreenDetection::State(_)) => None,
            }
        };

        if let Some(new_state) = transition {
            self.on_transition(new_state);
        }
    }

    fn on_transition(self: &Arc<Self>, new_state: OnboardingState) {
        if new_state == OnboardingState::Complete {
            // Other agent sessions should refresh their credentials.
            if let Some(hook) = self.on_sessions_changed.clone() {
                tokio::spawn(async move { hook() });
            }
            return;
        }
        if !new_state.auto_advances() {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ADVANCE_GRACE).await;
            let mut st = inner.status.lock().unwrap();
            // The screen may have moved on during the grace period.
            if st.state != new_state {
                return;
            }
            let now = Instant::now();
            match new_state {
                OnboardingState::BypassPermissions => {
                    st.pending.push_back(PendingWrite {
                        bytes: b"2".to_vec(),
                        not_before: now,
                    });
                    st.pending.push_back(PendingWrite {
                        bytes: b"\r".to_vec(),
                        not_before: now + BYPASS_KEY_SPACING,
                    });
                }
                // Every other advancing screen confirms with a return.
                _ => {
                    st.pending.push_back(PendingWrite {
                        bytes: b"\r".to_vec(),
                        not_before: now,
                    });
                }
            }
        });
    }

    /// Write at most one due keystroke. The status mutex is released before
    /// the write; a failed write ends onboarding with a friendly message.
    fn flush_pending(self: &Arc<Self>) {
        let due = {
            let mut st = self.status.lock().unwrap();
            let ready = st
                .pending
                .front()
                .is_some_and(|w| w.not_before <= Instant::now());
            if ready {
                st.pending.pop_front()
            } else {
                None
            }
        };
        let Some(write) = due else {
            return;
        };

        let result = self.writer.lock().unwrap().write(&write.bytes);
        if let Err(e) = result {
            warn!("keystroke write failed: {e}");
            let mut st = self.status.lock().unwrap();
            st.state = OnboardingState::Error;
            st.error_message = Some(WRITE_FAILED_MESSAGE.to_string());
            st.pending.clear();
        }
    }

    /// Enforce per-state timeouts: two recovery returns, then a terminal
    /// error with a message that names no internals.
    fn check_timeout(self: &Arc<Self>) {
        let mut st = self.status.lock().unwrap();
        if st.state.is_terminal() {
            return;
        }
        let limit = if st.state == OnboardingState::AuthWaiting {
            AUTH_WAITING_TIMEOUT
        } else {
            STATE_TIMEOUT
        };
        if st.entered_at.elapsed() < limit {
            return;
        }

        let state = st.state;
        let attempts = st.recovery_attempts.entry(state).or_insert(0);
        *attempts += 1;
        if *attempts <= MAX_RECOVERY_ATTEMPTS {
            debug!("state {state:?} timed out, recovery attempt {attempts}");
            let now = Instant::now();
            st.pending.push_back(PendingWrite {
                bytes: b"\r".to_vec(),
                not_before: now,
            });
            st.entered_at = now;
        } else {
            warn!("state {state:?} stuck after {MAX_RECOVERY_ATTEMPTS} recovery attempts");
            st.state = OnboardingState::Error;
            st.error_message = Some(RECOVERY_FAILED_MESSAGE.to_string());
            st.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::pty::testing::RecordingWriter;

    const THEME_SCREEN: &str = "Choose the text style that looks best with your terminal";
    const AUTH_METHOD_SCREEN: &str = "Select login method:\n> 1. Claude account";
    const AUTH_WAIT_SCREEN: &str =
        "Visit https://claude.ai/oauth/authorize?x=1 \nPaste code here if prompted:";
    const CONFIRM_SCREEN: &str = "Login successful. Press Enter to continue";

    fn attach_driver() -> (
        OnboardingDriver,
        RecordingWriter,
        mpsc::Sender<Vec<u8>>,
    ) {
        let writer = RecordingWriter::default();
        let (tx, rx) = mpsc::channel(16);
        let driver = OnboardingDriver::attach(Box::new(writer.clone()), rx, 24, 80, None);
        (driver, writer, tx)
    }

    async fn feed(tx: &mpsc::Sender<Vec<u8>>, text: &str) {
        tx.send(text.as_bytes().to_vec()).await.unwrap();
        // Let the reader task run.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn attached_pty_gets_resize_nudge() {
        let (_driver, writer, _tx) = attach_driver();
        assert_eq!(writer.resizes.lock().unwrap().as_slice(), &[(24, 80)]);
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_advances_and_accepts_code() {
        let (driver, writer, tx) = attach_driver();

        // Theme screen: exactly one return within 400 ms.
        feed(&tx, THEME_SCREEN).await;
        assert_eq!(driver.status().state, OnboardingState::ThemeSelect);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(writer.written_bytes(), b"\r");

        // Auth method screen: one more return.
        feed(&tx, AUTH_METHOD_SCREEN).await;
        assert_eq!(driver.status().state, OnboardingState::AuthMethod);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(writer.written_bytes(), b"\r\r");

        // OAuth prompt: URL extracted, no auto-advance.
        feed(&tx, AUTH_WAIT_SCREEN).await;
        let status = driver.status();
        assert_eq!(status.state, OnboardingState::AuthWaiting);
        assert_eq!(
            status.oauth_url.as_deref(),
            Some("https://claude.ai/oauth/authorize?x=1")
        );
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(writer.written_bytes(), b"\r\r", "AuthWaiting must not advance");

        // Code submission: bytes, then a return ~100 ms later.
        driver.submit_code("abc").unwrap();
        assert!(driver.code_submitted());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(writer.written_bytes(), b"\r\rabc\r");
        {
            let writes = writer.writes.lock().unwrap();
            let code_at = writes[2].0;
            let return_at = writes[3].0;
            assert!(return_at.duration_since(code_at) >= CODE_RETURN_DELAY);
        }

        // Success screen auto-advances.
        feed(&tx, CONFIRM_SCREEN).await;
        assert_eq!(driver.status().state, OnboardingState::AuthConfirm);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(writer.written_bytes(), b"\r\rabc\r\r");

        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn submit_code_outside_auth_waiting_fails_without_writes() {
        let (driver, writer, tx) = attach_driver();
        feed(&tx, THEME_SCREEN).await;

        let err = driver.submit_code("abc").unwrap_err();
        assert!(matches!(err, Error::Onboarding(_)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let bytes = writer.written_bytes();
        assert!(
            !bytes.windows(3).any(|w| w == b"abc"),
            "code must not reach the PTY"
        );
        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_keeps_auth_waiting_and_allows_resubmit() {
        let (driver, writer, tx) = attach_driver();

        feed(&tx, AUTH_WAIT_SCREEN).await;
        assert_eq!(driver.status().state, OnboardingState::AuthWaiting);
        driver.submit_code("abc").unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let writes_before = writer.writes.lock().unwrap().len();
        feed(&tx, "Invalid code. Press Enter to retry").await;

        let status = driver.status();
        assert_eq!(status.state, OnboardingState::AuthWaiting);
        assert_eq!(
            status.error_message.as_deref(),
            Some("Invalid authentication code. Please verify you copied the entire code.")
        );
        assert!(!driver.code_submitted());

        // The retry return reaches the PTY within 200 ms.
        tokio::time::sleep(Duration::from_millis(200)).await;
        {
            let writes = writer.writes.lock().unwrap();
            assert_eq!(writes.len(), writes_before + 1);
            assert_eq!(writes.last().unwrap().1, b"\r");
        }

        // A fresh code is accepted and clears the error.
        driver.submit_code("def").unwrap();
        assert!(driver.status().error_message.is_none());
        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_state_recovers_twice_then_errors() {
        let (driver, writer, tx) = attach_driver();
        feed(&tx, THEME_SCREEN).await;
        tokio::time::sleep(Duration::from_millis(450)).await;
        let base_writes = writer.writes.lock().unwrap().len();

        // First and second timeouts send recovery returns.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(driver.status().state, OnboardingState::ThemeSelect);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(driver.status().state, OnboardingState::ThemeSelect);
        assert!(writer.writes.lock().unwrap().len() >= base_writes + 2);

        // Third timeout gives up with the fixed user-facing message.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let status = driver.status();
        assert_eq!(status.state, OnboardingState::Error);
        assert_eq!(status.error_message.as_deref(), Some(RECOVERY_FAILED_MESSAGE));
        let message = status.error_message.unwrap();
        assert!(!message.contains("PTY"));
        assert!(!message.contains("ThemeSelect"));
        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_buffer_never_exceeds_cap() {
        let (driver, _writer, tx) = attach_driver();
        for _ in 0..5 {
            feed(&tx, &"x".repeat(4000)).await;
        }
        assert!(driver.status().output.len() <= BUFFER_CAP);
        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_becomes_friendly_error() {
        let (driver, writer, tx) = attach_driver();
        *writer.fail_writes.lock().unwrap() = true;

        feed(&tx, THEME_SCREEN).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        let status = driver.status();
        assert_eq!(status.state, OnboardingState::Error);
        let message = status.error_message.unwrap();
        assert!(!message.contains("PTY"));
        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn complete_invokes_sessions_changed_hook() {
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_flag = Arc::clone(&fired);
        let writer = RecordingWriter::default();
        let (tx, rx) = mpsc::channel(16);
        let driver = OnboardingDriver::attach(
            Box::new(writer),
            rx,
            24,
            80,
            Some(Arc::new(move || {
                hook_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
        );

        feed(&tx, "Welcome back\n? for shortcuts").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.status().state, OnboardingState::Complete);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        driver.stop();
    }
}
