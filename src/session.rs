//! Session lifecycle state and the controller that reconciles backend events.
//!
//! The backend is the single source of truth for the session state machine
//! (`Idle → Preparing → Recording → Stopping → Completed`, with `Error`
//! reachable from any non-terminal state). The controller here never
//! validates transitions: every `session_status` event replaces the local
//! status wholesale, last write wins. The only locally derived values are
//! the elapsed-time ticker and the user-editable transcript copy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activity_log;
use crate::biomarkers::{AudioQualitySnapshot, BiomarkerUpdate};
use crate::gateway::{Gateway, GatewayError};

/// Resolution of the local elapsed-time ticker
pub const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Session state reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Preparing,
    Recording,
    Stopping,
    Completed,
    Error,
}

impl SessionState {
    /// True while the backend is capturing audio and the local ticker runs
    pub fn is_active_capture(&self) -> bool {
        matches!(self, SessionState::Preparing | SessionState::Recording)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::Error => "error",
        }
    }
}

/// Status update pushed by the backend on `session_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub provider: Option<String>,
    pub elapsed_ms: u64,
    pub is_processing_behind: bool,
    pub error_message: Option<String>,
    pub session_id: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            provider: None,
            elapsed_ms: 0,
            is_processing_behind: false,
            error_message: None,
            session_id: None,
        }
    }
}

/// Transcript update pushed by the backend on `transcript_update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptUpdate {
    pub finalized_text: String,
    pub draft_text: Option<String>,
    pub segment_count: usize,
}

/// Panel display mode, a pure function of the latest session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiMode {
    Ready,
    Recording,
    Review,
}

impl UiMode {
    pub fn from_state(state: SessionState) -> Self {
        match state {
            SessionState::Preparing | SessionState::Recording | SessionState::Stopping => {
                UiMode::Recording
            }
            SessionState::Completed => UiMode::Review,
            SessionState::Idle | SessionState::Error => UiMode::Ready,
        }
    }
}

/// Immutable snapshot published after every mutation
#[derive(Debug, Clone)]
pub struct SessionView {
    pub status: SessionStatus,
    pub mode: UiMode,
    pub transcript: TranscriptUpdate,
    /// User-editable transcript copy; mirrors `finalized_text` until edited
    pub edited_transcript: String,
    pub biomarkers: Option<BiomarkerUpdate>,
    pub audio_quality: Option<AudioQualitySnapshot>,
    /// Session duration for display: live while recording, frozen on
    /// completion, zero when idle
    pub display_elapsed_ms: u64,
}

impl Default for SessionView {
    fn default() -> Self {
        SessionData::default().view()
    }
}

#[derive(Default)]
struct SessionData {
    status: SessionStatus,
    transcript: TranscriptUpdate,
    /// `None` while the editable copy mirrors `finalized_text`
    edited: Option<String>,
    biomarkers: Option<BiomarkerUpdate>,
    audio_quality: Option<AudioQualitySnapshot>,
    /// Captured once per Preparing/Recording episode
    recording_start: Option<Instant>,
    display_elapsed_ms: u64,
}

impl SessionData {
    fn view(&self) -> SessionView {
        SessionView {
            status: self.status.clone(),
            mode: UiMode::from_state(self.status.state),
            transcript: self.transcript.clone(),
            edited_transcript: self
                .edited
                .clone()
                .unwrap_or_else(|| self.transcript.finalized_text.clone()),
            biomarkers: self.biomarkers.clone(),
            audio_quality: self.audio_quality.clone(),
            display_elapsed_ms: self.display_elapsed_ms,
        }
    }
}

/// Owns the session state and is its only mutator. Consumers subscribe to
/// the published [`SessionView`] and stay read-only.
pub struct SessionController {
    gateway: Gateway,
    data: Arc<Mutex<SessionData>>,
    view_tx: watch::Sender<SessionView>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(gateway: Gateway) -> Self {
        let (view_tx, _view_rx) = watch::channel(SessionView::default());
        Self {
            gateway,
            data: Arc::new(Mutex::new(SessionData::default())),
            view_tx,
            ticker: Mutex::new(None),
        }
    }

    /// Subscribe to published snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionView {
        self.data.lock().unwrap().view()
    }

    fn publish(&self, view: SessionView) {
        self.view_tx.send_replace(view);
    }

    /// Apply a `session_status` event. The payload is authoritative and
    /// replaces local status wholesale, whatever the previous state was.
    pub fn apply_status(&self, status: SessionStatus) {
        let view = {
            let mut data = self.data.lock().unwrap();

            if data.status.state != status.state {
                activity_log::log_session_transition(
                    status.session_id.as_deref(),
                    data.status.state.as_str(),
                    status.state.as_str(),
                );
            }

            if status.state.is_active_capture() {
                if data.recording_start.is_none() {
                    // Seed from the reported elapsed so a panel attaching
                    // mid-session continues the backend's clock.
                    data.recording_start =
                        Some(Instant::now() - Duration::from_millis(status.elapsed_ms));
                }
            } else {
                data.recording_start = None;
            }

            match status.state {
                SessionState::Idle => data.display_elapsed_ms = 0,
                SessionState::Preparing | SessionState::Recording | SessionState::Stopping => {
                    data.display_elapsed_ms = status.elapsed_ms;
                }
                // Frozen at the last value computed while active
                SessionState::Completed | SessionState::Error => {}
            }

            data.status = status;
            data.view()
        };
        self.publish(view);
        self.sync_ticker();
    }

    /// Apply a `transcript_update` event (wholesale replacement)
    pub fn apply_transcript(&self, update: TranscriptUpdate) {
        let view = {
            let mut data = self.data.lock().unwrap();
            data.transcript = update;
            data.view()
        };
        self.publish(view);
    }

    /// Apply a `biomarker_update` event
    pub fn apply_biomarkers(&self, update: BiomarkerUpdate) {
        let view = {
            let mut data = self.data.lock().unwrap();
            data.biomarkers = Some(update);
            data.view()
        };
        self.publish(view);
    }

    /// Apply an `audio_quality` event
    pub fn apply_audio_quality(&self, snapshot: AudioQualitySnapshot) {
        let view = {
            let mut data = self.data.lock().unwrap();
            data.audio_quality = Some(snapshot);
            data.view()
        };
        self.publish(view);
    }

    /// Record a user edit to the transcript copy
    pub fn set_edited_transcript(&self, text: String) {
        let view = {
            let mut data = self.data.lock().unwrap();
            data.edited = Some(text);
            data.view()
        };
        self.publish(view);
    }

    /// Drop leftover per-session text before a new capture begins
    pub fn clear_transcript(&self) {
        let view = {
            let mut data = self.data.lock().unwrap();
            data.transcript = TranscriptUpdate::default();
            data.edited = None;
            data.view()
        };
        self.publish(view);
    }

    /// Start a session. Non-optimistic: the local state moves only when the
    /// resulting `session_status` event arrives. Failures are logged and the
    /// UI stays in whatever state it already held.
    pub async fn start(&self, device_id: Option<&str>) {
        info!(device_id, "starting session");
        {
            let mut data = self.data.lock().unwrap();
            data.edited = None;
        }
        self.publish(self.snapshot());

        if let Err(e) = self.gateway.start_session(device_id).await {
            warn!(error = %e, "start_session failed");
        }
    }

    /// Stop the session. Same non-optimistic contract as [`start`].
    ///
    /// [`start`]: SessionController::start
    pub async fn stop(&self) {
        info!("stopping session");
        if let Err(e) = self.gateway.stop_session().await {
            warn!(error = %e, "stop_session failed");
        }
    }

    /// Reset to idle. Local cleanup is unconditional: the snapshots are
    /// cleared whether or not the backend accepted the command.
    pub async fn reset(&self) {
        let session_id = { self.data.lock().unwrap().status.session_id.clone() };
        activity_log::log_session_reset(session_id.as_deref());

        if let Err(e) = self.gateway.reset_session().await {
            warn!(error = %e, "reset_session failed, clearing local state anyway");
        }

        let view = {
            let mut data = self.data.lock().unwrap();
            data.transcript = TranscriptUpdate::default();
            data.edited = None;
            data.biomarkers = None;
            data.audio_quality = None;
            data.view()
        };
        self.publish(view);
    }

    /// Start or stop the elapsed-time ticker to match the current state
    fn sync_ticker(&self) {
        let active = self.data.lock().unwrap().status.state.is_active_capture();
        let mut guard = self.ticker.lock().unwrap();

        if !active {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
            return;
        }

        let running = guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }

        debug!("starting elapsed ticker");
        let data = Arc::clone(&self.data);
        let view_tx = self.view_tx.clone();
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let view = {
                    let mut data = data.lock().unwrap();
                    match data.recording_start {
                        Some(start) if data.status.state.is_active_capture() => {
                            let elapsed = start.elapsed().as_millis() as u64;
                            data.status.elapsed_ms = elapsed;
                            data.display_elapsed_ms = elapsed;
                            Some(data.view())
                        }
                        _ => None,
                    }
                };
                match view {
                    Some(view) => {
                        view_tx.send_replace(view);
                    }
                    None => break,
                }
            }
        }));
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Gateway {
    pub async fn start_session(&self, device_id: Option<&str>) -> Result<(), GatewayError> {
        self.unit("start_session", json!({ "deviceId": device_id }))
            .await
    }

    pub async fn stop_session(&self) -> Result<(), GatewayError> {
        self.unit("stop_session", json!({})).await
    }

    pub async fn reset_session(&self) -> Result<(), GatewayError> {
        self.unit("reset_session", json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CommandGateway;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NullGateway;

    #[async_trait]
    impl CommandGateway for NullGateway {
        async fn invoke(&self, _command: &str, _args: Value) -> Result<Value, GatewayError> {
            Ok(Value::Null)
        }
    }

    fn controller() -> SessionController {
        SessionController::new(Gateway::new(Arc::new(NullGateway)))
    }

    fn status(state: SessionState, elapsed_ms: u64) -> SessionStatus {
        SessionStatus {
            state,
            elapsed_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_ui_mode_is_pure_function_of_state() {
        assert_eq!(UiMode::from_state(SessionState::Idle), UiMode::Ready);
        assert_eq!(UiMode::from_state(SessionState::Error), UiMode::Ready);
        assert_eq!(UiMode::from_state(SessionState::Preparing), UiMode::Recording);
        assert_eq!(UiMode::from_state(SessionState::Recording), UiMode::Recording);
        assert_eq!(UiMode::from_state(SessionState::Stopping), UiMode::Recording);
        assert_eq!(UiMode::from_state(SessionState::Completed), UiMode::Review);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_value(SessionState::Preparing).unwrap();
        assert_eq!(json, "preparing");
    }

    #[tokio::test]
    async fn test_status_events_are_authoritative() {
        let c = controller();
        c.apply_status(status(SessionState::Completed, 9_000));
        // A stray Recording event after Completed is accepted as-is
        c.apply_status(status(SessionState::Recording, 9_500));
        assert_eq!(c.snapshot().status.state, SessionState::Recording);
        assert_eq!(c.snapshot().mode, UiMode::Recording);
    }

    #[tokio::test]
    async fn test_display_elapsed_freezes_on_completed() {
        let c = controller();
        c.apply_status(status(SessionState::Recording, 5_000));
        c.apply_status(status(SessionState::Stopping, 5_200));
        c.apply_status(status(SessionState::Completed, 0));
        assert_eq!(c.snapshot().display_elapsed_ms, 5_200);
    }

    #[tokio::test]
    async fn test_display_elapsed_resets_on_idle() {
        let c = controller();
        c.apply_status(status(SessionState::Recording, 5_000));
        c.apply_status(status(SessionState::Idle, 0));
        assert_eq!(c.snapshot().display_elapsed_ms, 0);
    }

    #[tokio::test]
    async fn test_edited_transcript_mirrors_until_diverged() {
        let c = controller();
        c.apply_transcript(TranscriptUpdate {
            finalized_text: "Patient reports cough.".to_string(),
            draft_text: None,
            segment_count: 1,
        });
        assert_eq!(c.snapshot().edited_transcript, "Patient reports cough.");

        c.set_edited_transcript("Patient reports a dry cough.".to_string());
        c.apply_transcript(TranscriptUpdate {
            finalized_text: "Patient reports cough. No fever.".to_string(),
            draft_text: None,
            segment_count: 2,
        });
        // Diverged copy survives later transcript events
        assert_eq!(c.snapshot().edited_transcript, "Patient reports a dry cough.");
    }

    #[tokio::test]
    async fn test_start_resets_edited_transcript() {
        let c = controller();
        c.set_edited_transcript("stale edit".to_string());
        c.start(None).await;
        assert_eq!(c.snapshot().edited_transcript, "");
    }

    #[tokio::test]
    async fn test_reset_clears_snapshots_unconditionally() {
        struct FailingGateway;

        #[async_trait]
        impl CommandGateway for FailingGateway {
            async fn invoke(&self, command: &str, _args: Value) -> Result<Value, GatewayError> {
                Err(GatewayError::Command {
                    command: command.to_string(),
                    message: "backend offline".to_string(),
                })
            }
        }

        let c = SessionController::new(Gateway::new(Arc::new(FailingGateway)));
        c.apply_transcript(TranscriptUpdate {
            finalized_text: "text".to_string(),
            draft_text: None,
            segment_count: 1,
        });
        c.set_edited_transcript("edited".to_string());
        c.apply_biomarkers(BiomarkerUpdate::default());
        c.apply_audio_quality(AudioQualitySnapshot::default());

        c.reset().await;

        let view = c.snapshot();
        assert_eq!(view.transcript.finalized_text, "");
        assert_eq!(view.edited_transcript, "");
        assert!(view.biomarkers.is_none());
        assert!(view.audio_quality.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_advances_elapsed_while_recording() {
        let c = controller();
        c.apply_status(status(SessionState::Recording, 0));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        // Let the ticker task observe the advanced clock
        tokio::task::yield_now().await;

        let elapsed = c.snapshot().display_elapsed_ms;
        assert!(elapsed >= 800, "elapsed {} should track the clock", elapsed);

        c.apply_status(status(SessionState::Completed, 0));
        let frozen = c.snapshot().display_elapsed_ms;
        tokio::time::advance(Duration::from_millis(1_000)).await;
        tokio::task::yield_now().await;
        assert_eq!(c.snapshot().display_elapsed_ms, frozen);
    }

    #[tokio::test]
    async fn test_recording_start_seeded_from_reported_elapsed() {
        let c = controller();
        c.apply_status(status(SessionState::Recording, 5_000));
        // The ticker must continue from the backend clock, not restart at zero
        assert!(c.snapshot().display_elapsed_ms >= 5_000);
    }
}
