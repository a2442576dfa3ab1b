//! Auto-detection coordinator: optimistic session start on detected speech.
//!
//! The backend listening pipeline watches the microphone while the panel is
//! idle. The instant it accumulates enough speech it tells the panel to
//! start recording, then keeps analyzing whether the speech was a greeting.
//! Recording starts before that verdict so no audio is lost; a rejected
//! greeting rolls the speculative session back. The pending-confirmation
//! flag is the single arbiter of that rollback: it is read at the moment the
//! rejection is handled, and a manual start always clears it first, so a
//! session the user adopted is never torn down.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::gateway::{Gateway, GatewayError};
use crate::session::SessionController;

/// Events pushed by the backend listening pipeline on `listening_event`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListeningEvent {
    /// Listening mode started
    Started,

    /// Speech detected, accumulating
    SpeechDetected { duration_ms: u32 },

    /// Analyzing speech for a session-starting greeting
    Analyzing,

    /// Start recording immediately, before the greeting check completes
    StartRecording { initial_audio_duration_ms: u32 },

    /// Greeting confirmed; the already-running session continues
    GreetingConfirmed {
        transcript: String,
        confidence: f32,
        detected_phrase: Option<String>,
    },

    /// Not a greeting; the speculative session should be discarded
    GreetingRejected { transcript: String, reason: String },

    /// Listening pipeline error
    Error { message: String },

    /// Listening mode stopped
    Stopped,
}

/// Listening pipeline status mirrored for display
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListeningStatus {
    pub is_listening: bool,
    pub speech_detected: bool,
    pub speech_duration_ms: u32,
    pub analyzing: bool,
}

/// Coordinator state exposed to the panel
#[derive(Debug, Clone, Default)]
pub struct AutoDetectionState {
    pub is_listening: bool,
    /// True only between an optimistic start and its confirmation/rejection
    pub is_pending_confirmation: bool,
    pub listening: ListeningStatus,
}

#[derive(Default)]
struct AutoDetectData {
    state: AutoDetectionState,
    /// Guards the listen/stop commands against re-entrant toggles
    toggle_in_flight: bool,
    input_device_id: Option<String>,
}

enum ListenToggle {
    Start(Option<String>),
    Stop,
}

pub struct AutoDetectCoordinator {
    gateway: Gateway,
    data: Mutex<AutoDetectData>,
}

impl AutoDetectCoordinator {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            data: Mutex::new(AutoDetectData::default()),
        }
    }

    pub fn state(&self) -> AutoDetectionState {
        self.data.lock().unwrap().state.clone()
    }

    /// Preferred capture device for optimistic starts
    pub fn set_input_device(&self, device_id: Option<String>) {
        self.data.lock().unwrap().input_device_id = device_id;
    }

    /// Clear the pending flag. The manual start path calls this before
    /// issuing its command so a rejection landing afterwards is a no-op.
    /// Returns whether a speculative session was pending.
    pub fn clear_pending(&self) -> bool {
        let mut data = self.data.lock().unwrap();
        let was_pending = data.state.is_pending_confirmation;
        data.state.is_pending_confirmation = false;
        was_pending
    }

    /// Apply a `listening_event` payload
    pub async fn handle_event(&self, event: ListeningEvent, session: &SessionController) {
        match event {
            ListeningEvent::Started => {
                let mut data = self.data.lock().unwrap();
                data.state.is_listening = true;
                data.state.listening = ListeningStatus {
                    is_listening: true,
                    ..Default::default()
                };
            }
            ListeningEvent::SpeechDetected { duration_ms } => {
                let mut data = self.data.lock().unwrap();
                data.state.listening.speech_detected = true;
                data.state.listening.speech_duration_ms = duration_ms;
            }
            ListeningEvent::Analyzing => {
                self.data.lock().unwrap().state.listening.analyzing = true;
            }
            ListeningEvent::StartRecording {
                initial_audio_duration_ms,
            } => {
                info!(initial_audio_duration_ms, "speech detected, starting optimistically");
                self.on_start_recording(session).await;
            }
            ListeningEvent::GreetingConfirmed { confidence, .. } => {
                self.on_greeting_confirmed(confidence);
            }
            ListeningEvent::GreetingRejected { reason, .. } => {
                self.on_greeting_rejected(&reason, session).await;
            }
            ListeningEvent::Error { message } => {
                warn!(message, "listening pipeline error");
                let mut data = self.data.lock().unwrap();
                data.state.listening.analyzing = false;
                data.state.listening.speech_detected = false;
            }
            ListeningEvent::Stopped => {
                let mut data = self.data.lock().unwrap();
                data.state.is_listening = false;
                data.state.listening = ListeningStatus::default();
            }
        }
    }

    /// Optimistic start: mark the session pending, drop leftover text from a
    /// previous attempt, and start through the same path as the manual button.
    pub async fn on_start_recording(&self, session: &SessionController) {
        let device_id = {
            let mut data = self.data.lock().unwrap();
            data.state.is_pending_confirmation = true;
            data.state.listening.analyzing = true;
            data.input_device_id.clone()
        };
        session.clear_transcript();
        session.start(device_id.as_deref()).await;
    }

    /// The greeting check passed; the session already runs, nothing to do
    /// beyond dropping the pending flag.
    pub fn on_greeting_confirmed(&self, confidence: f32) {
        info!(confidence, "greeting confirmed");
        let mut data = self.data.lock().unwrap();
        data.state.is_pending_confirmation = false;
        data.state.listening.analyzing = false;
        data.state.listening.speech_detected = false;
        data.state.listening.speech_duration_ms = 0;
    }

    /// Roll back the speculative session, but only if it is still pending.
    /// The flag is read here, at handling time: a manual start that already
    /// cleared it keeps the session.
    pub async fn on_greeting_rejected(&self, reason: &str, session: &SessionController) {
        let should_reset = {
            let mut data = self.data.lock().unwrap();
            let was_pending = data.state.is_pending_confirmation;
            data.state.is_pending_confirmation = false;
            data.state.listening.analyzing = false;
            data.state.listening.speech_detected = false;
            data.state.listening.speech_duration_ms = 0;
            was_pending
        };

        if should_reset {
            info!(reason, "greeting rejected, rolling back speculative session");
            session.reset().await;
        } else {
            debug!(reason, "greeting rejection ignored: session no longer pending");
        }
    }

    /// Level-triggered listening policy: converge to `should_listen`
    /// whichever input changed. Safe to call on every reconcile pass.
    pub async fn sync_listening(&self, should_listen: bool) {
        let toggle = {
            let mut data = self.data.lock().unwrap();
            if data.toggle_in_flight {
                None
            } else if should_listen && !data.state.is_listening {
                data.toggle_in_flight = true;
                Some(ListenToggle::Start(data.input_device_id.clone()))
            } else if !should_listen && data.state.is_listening {
                data.toggle_in_flight = true;
                Some(ListenToggle::Stop)
            } else {
                None
            }
        };

        match toggle {
            Some(ListenToggle::Start(device_id)) => {
                let result = self.gateway.start_listening(device_id.as_deref()).await;
                let mut data = self.data.lock().unwrap();
                data.toggle_in_flight = false;
                match result {
                    Ok(()) => {
                        data.state.is_listening = true;
                        data.state.listening.is_listening = true;
                    }
                    Err(e) => warn!(error = %e, "start_listening failed"),
                }
            }
            Some(ListenToggle::Stop) => {
                let result = self.gateway.stop_listening().await;
                let mut data = self.data.lock().unwrap();
                data.toggle_in_flight = false;
                match result {
                    Ok(()) => {
                        data.state.is_listening = false;
                        data.state.listening = ListeningStatus::default();
                    }
                    Err(e) => warn!(error = %e, "stop_listening failed"),
                }
            }
            None => {}
        }
    }
}

impl Gateway {
    pub async fn start_listening(&self, device_id: Option<&str>) -> Result<(), GatewayError> {
        self.unit("start_listening", json!({ "deviceId": device_id }))
            .await
    }

    pub async fn stop_listening(&self) -> Result<(), GatewayError> {
        self.unit("stop_listening", json!({})).await
    }
}
