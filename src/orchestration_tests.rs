//! Panel-level orchestration tests
//!
//! These exercise the wired panel against a scripted backend: push events go
//! in through the real subscription/dispatch path (or directly through
//! `handle_event` where mount plumbing is not the point), and assertions run
//! against the commands the backend actually received.
//!
//! Layers:
//!
//! ```text
//! Layer 1: Mode derivation     — status streams drive ready/recording/review
//! Layer 2: Reset semantics     — local cleanup regardless of command outcome
//! Layer 3: Auto triggers       — at-most-once generation and sync
//! Layer 4: Sync dispatch       — attach vs create vs multi-patient
//! Layer 5: Auto-detection race — manual start beats a late rejection
//! Layer 6: Mount lifecycle     — subscriptions open, deliver, and tear down
//! ```

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::autodetect::ListeningEvent;
    use crate::config::Settings;
    use crate::events::{EventSource, EventTopic, PushEvent, SubscribeError, SubscriptionToken};
    use crate::gateway::{CommandGateway, Gateway, GatewayError};
    use crate::notegen::CombinedStatus;
    use crate::panel::ScribePanel;
    use crate::session::{
        SessionController, SessionState, SessionStatus, TranscriptUpdate, UiMode,
    };

    // ========================================================================
    // Test doubles
    // ========================================================================

    /// Backend double: canned responses per command, `Null` otherwise, and a
    /// full log of (command, args) pairs
    struct ScriptedBackend {
        responses: Mutex<HashMap<&'static str, Value>>,
        failing: Mutex<HashSet<&'static str>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn respond(&self, command: &'static str, value: Value) {
            self.responses.lock().unwrap().insert(command, value);
        }

        fn fail(&self, command: &'static str) {
            self.failing.lock().unwrap().insert(command);
        }

        fn count(&self, command: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == command)
                .count()
        }

        fn args_of(&self, command: &str) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == command)
                .map(|(_, args)| args.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandGateway for ScriptedBackend {
        async fn invoke(&self, command: &str, args: Value) -> Result<Value, GatewayError> {
            self.calls.lock().unwrap().push((command.to_string(), args));
            if self.failing.lock().unwrap().contains(command) {
                return Err(GatewayError::Command {
                    command: command.to_string(),
                    message: "scripted failure".to_string(),
                });
            }
            let canned = self.responses.lock().unwrap().get(command).cloned();
            Ok(canned.unwrap_or(Value::Null))
        }
    }

    /// Event source double that records sinks so tests can push payloads
    struct TestSource {
        sinks: Mutex<HashMap<&'static str, mpsc::Sender<Value>>>,
        unsubscribed: Arc<AtomicUsize>,
    }

    impl TestSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sinks: Mutex::new(HashMap::new()),
                unsubscribed: Arc::new(AtomicUsize::new(0)),
            })
        }

        async fn ready(&self) {
            wait_until(|| self.sinks.lock().unwrap().len() == EventTopic::ALL.len()).await;
        }

        async fn emit(&self, topic: EventTopic, payload: Value) {
            let sink = {
                let sinks = self.sinks.lock().unwrap();
                sinks[topic.as_str()].clone()
            };
            sink.send(payload).await.unwrap();
        }
    }

    #[async_trait]
    impl EventSource for TestSource {
        async fn subscribe(
            &self,
            topic: EventTopic,
            sink: mpsc::Sender<Value>,
        ) -> Result<SubscriptionToken, SubscribeError> {
            self.sinks.lock().unwrap().insert(topic.as_str(), sink);
            let count = Arc::clone(&self.unsubscribed);
            Ok(SubscriptionToken::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn status(state: SessionState, elapsed_ms: u64) -> SessionStatus {
        SessionStatus {
            state,
            session_id: Some("session-1".to_string()),
            elapsed_ms,
            ..Default::default()
        }
    }

    fn transcript(text: &str) -> TranscriptUpdate {
        TranscriptUpdate {
            finalized_text: text.to_string(),
            draft_text: None,
            segment_count: 1,
        }
    }

    fn single_note_response() -> Value {
        json!({
            "notes": [
                { "patient_label": "Patient 1", "speaker_id": "Speaker 1", "content": "S: cough" }
            ],
            "physician_speaker": "Speaker 2",
            "generated_at": "2026-08-07T10:00:00Z",
            "model_used": "clinical-notes-v2"
        })
    }

    fn two_note_response() -> Value {
        json!({
            "notes": [
                { "patient_label": "Patient 1", "speaker_id": "Speaker 1", "content": "note one" },
                { "patient_label": "Patient 2", "speaker_id": "Speaker 3", "content": "note two" }
            ],
            "physician_speaker": "Speaker 2",
            "generated_at": "2026-08-07T10:00:00Z",
            "model_used": "clinical-notes-v2"
        })
    }

    fn sync_ok_response() -> Value {
        json!({
            "success": true,
            "error": null,
            "encounterId": "enc-1",
            "encounterFhirId": "fhir-enc-1"
        })
    }

    fn authenticated_response() -> Value {
        json!({
            "is_authenticated": true,
            "practitioner_id": "prac-1",
            "practitioner_name": "Dr. Osei"
        })
    }

    /// Panel with restored auth, connectivity, and the given toggles
    async fn signed_in_panel(
        backend: &Arc<ScriptedBackend>,
        auto_sync_enabled: bool,
    ) -> ScribePanel {
        backend.respond("medplum_try_restore_session", authenticated_response());
        backend.respond("medplum_check_connection", json!(true));
        let panel = ScribePanel::new(backend.clone() as Arc<dyn CommandGateway>);
        panel.auth().restore_session().await;
        panel.auth().refresh_connectivity().await;
        panel
            .update_settings(Settings {
                auto_sync_enabled,
                auto_start_enabled: false,
                ..Default::default()
            })
            .await
            .unwrap();
        panel
    }

    // ========================================================================
    // Layer 1: Mode derivation
    // ========================================================================

    proptest! {
        /// For any status stream, the mode is a pure function of the latest
        /// state: a panel that saw the whole history and one that saw only
        /// the final event agree.
        #[test]
        fn prop_mode_depends_only_on_latest_state(indices in prop::collection::vec(0..6usize, 1..20)) {
            let states = [
                SessionState::Idle,
                SessionState::Preparing,
                SessionState::Recording,
                SessionState::Stopping,
                SessionState::Completed,
                SessionState::Error,
            ];
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let gateway = Gateway::new(
                    ScriptedBackend::new() as Arc<dyn CommandGateway>
                );
                let full_history = SessionController::new(gateway.clone());
                let last_only = SessionController::new(gateway);

                for &i in &indices {
                    full_history.apply_status(status(states[i], 0));
                }
                let last = states[*indices.last().unwrap()];
                last_only.apply_status(status(last, 0));

                prop_assert_eq!(full_history.snapshot().mode, last_only.snapshot().mode);
                prop_assert_eq!(full_history.snapshot().mode, UiMode::from_state(last));
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn test_status_stream_drives_mode_and_frozen_duration() {
        let backend = ScriptedBackend::new();
        let panel = ScribePanel::new(backend as Arc<dyn CommandGateway>);

        let stream = [
            (SessionState::Idle, 0, UiMode::Ready),
            (SessionState::Preparing, 0, UiMode::Recording),
            (SessionState::Recording, 5_000, UiMode::Recording),
            (SessionState::Stopping, 5_000, UiMode::Recording),
            (SessionState::Completed, 0, UiMode::Review),
        ];
        for (state, elapsed, expected_mode) in stream {
            panel
                .handle_event(PushEvent::SessionStatus(status(state, elapsed)))
                .await;
            assert_eq!(panel.view().mode, expected_mode);
        }

        panel
            .handle_event(PushEvent::Transcript(transcript("Patient reports cough.")))
            .await;

        let view = panel.view();
        assert_eq!(view.display_elapsed_ms, 5_000);
        assert_eq!(view.transcript.finalized_text, "Patient reports cough.");
        assert_eq!(view.edited_transcript, "Patient reports cough.");
    }

    // ========================================================================
    // Layer 2: Reset semantics
    // ========================================================================

    #[tokio::test]
    async fn test_reset_clears_session_scope_even_when_command_fails() {
        let backend = ScriptedBackend::new();
        backend.respond("generate_soap_note", single_note_response());
        backend.fail("reset_session");
        let panel = ScribePanel::new(backend.clone() as Arc<dyn CommandGateway>);

        panel
            .handle_event(PushEvent::Transcript(transcript("Patient reports cough.")))
            .await;
        panel.set_edited_transcript("edited text".to_string());
        panel.generate_note().await;
        assert!(panel.notes().result().is_some());

        panel.reset().await;

        let view = panel.view();
        assert_eq!(view.transcript.finalized_text, "");
        assert_eq!(view.edited_transcript, "");
        assert!(view.biomarkers.is_none());
        assert!(view.audio_quality.is_none());
        assert!(panel.notes().result().is_none());
        assert!(panel.notes().synced_encounter().is_none());
        assert_eq!(backend.count("reset_session"), 1);
    }

    // ========================================================================
    // Layer 3: Auto triggers
    // ========================================================================

    #[tokio::test]
    async fn test_auto_generation_fires_exactly_once_for_duplicate_completed() {
        let backend = ScriptedBackend::new();
        backend.respond("generate_soap_note", single_note_response());
        let panel = signed_in_panel(&backend, false).await;

        panel
            .handle_event(PushEvent::Transcript(transcript("Patient reports cough.")))
            .await;
        // Completed delivered twice in a row
        panel
            .handle_event(PushEvent::SessionStatus(status(SessionState::Completed, 0)))
            .await;
        panel
            .handle_event(PushEvent::SessionStatus(status(SessionState::Completed, 0)))
            .await;

        wait_until(|| !panel.notes().is_generating() && panel.notes().result().is_some()).await;
        assert_eq!(backend.count("generate_soap_note"), 1);
    }

    #[tokio::test]
    async fn test_auto_generation_requires_connectivity() {
        let backend = ScriptedBackend::new();
        backend.respond("generate_soap_note", single_note_response());
        backend.respond("medplum_check_connection", json!(false));
        let panel = ScribePanel::new(backend.clone() as Arc<dyn CommandGateway>);
        panel.auth().refresh_connectivity().await;

        panel
            .handle_event(PushEvent::Transcript(transcript("Patient reports cough.")))
            .await;
        panel
            .handle_event(PushEvent::SessionStatus(status(SessionState::Completed, 0)))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.count("generate_soap_note"), 0);
    }

    #[tokio::test]
    async fn test_auto_sync_then_generation_attaches_to_same_encounter() {
        let backend = ScriptedBackend::new();
        backend.respond("generate_soap_note", single_note_response());
        backend.respond("medplum_quick_sync", sync_ok_response());
        backend.respond("medplum_add_soap_to_encounter", json!(true));
        let panel = signed_in_panel(&backend, true).await;

        panel
            .handle_event(PushEvent::Transcript(transcript("Patient reports cough.")))
            .await;
        panel
            .handle_event(PushEvent::SessionStatus(status(SessionState::Completed, 0)))
            .await;

        wait_until(|| {
            panel
                .notes()
                .synced_encounter()
                .map(|e| e.has_soap)
                .unwrap_or(false)
        })
        .await;

        // One create (transcript-only), one attach, never a second create
        assert_eq!(backend.count("medplum_quick_sync"), 1);
        assert_eq!(backend.count("medplum_add_soap_to_encounter"), 1);

        let sync_args = backend.args_of("medplum_quick_sync");
        assert!(sync_args[0]["soapNote"].is_null());

        let attach_args = backend.args_of("medplum_add_soap_to_encounter");
        assert_eq!(attach_args[0]["encounterFhirId"], "fhir-enc-1");
    }

    // ========================================================================
    // Layer 4: Sync dispatch
    // ========================================================================

    #[tokio::test]
    async fn test_two_patients_use_multi_sync_exclusively() {
        let backend = ScriptedBackend::new();
        backend.respond("generate_soap_note", two_note_response());
        backend.respond(
            "medplum_multi_patient_quick_sync",
            json!({ "success": true, "patients": [], "error": null }),
        );
        let panel = signed_in_panel(&backend, false).await;

        panel
            .handle_event(PushEvent::Transcript(transcript(
                "Two patients discuss symptoms.",
            )))
            .await;
        panel
            .handle_event(PushEvent::SessionStatus(status(SessionState::Completed, 0)))
            .await;

        wait_until(|| backend.count("medplum_multi_patient_quick_sync") == 1).await;

        assert_eq!(backend.count("medplum_quick_sync"), 0);
        assert_eq!(backend.count("medplum_add_soap_to_encounter"), 0);

        let args = backend.args_of("medplum_multi_patient_quick_sync");
        let labels: Vec<&str> = args[0]["soapResult"]["notes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|note| note["patient_label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["Patient 1", "Patient 2"]);
    }

    #[tokio::test]
    async fn test_combined_status_reaches_success_and_dismisses() {
        let backend = ScriptedBackend::new();
        backend.respond("generate_soap_note", single_note_response());
        backend.respond("medplum_quick_sync", sync_ok_response());
        let panel = signed_in_panel(&backend, false).await;

        panel
            .handle_event(PushEvent::Transcript(transcript("Patient reports cough.")))
            .await;
        panel
            .handle_event(PushEvent::SessionStatus(status(SessionState::Completed, 0)))
            .await;
        wait_until(|| panel.combined_sync_status() == CombinedStatus::Success).await;

        panel.dismiss_sync_status();
        assert_eq!(panel.combined_sync_status(), CombinedStatus::Idle);
    }

    // ========================================================================
    // Layer 5: Auto-detection race
    // ========================================================================

    #[tokio::test]
    async fn test_manual_start_beats_late_rejection() {
        let backend = ScriptedBackend::new();
        let panel = ScribePanel::new(backend.clone() as Arc<dyn CommandGateway>);

        // Speculative start
        panel
            .handle_event(PushEvent::Listening(ListeningEvent::StartRecording {
                initial_audio_duration_ms: 2_000,
            }))
            .await;
        assert!(panel.autodetect_state().is_pending_confirmation);
        assert_eq!(backend.count("start_session"), 1);

        // Manual start lands before the rejection callback fires
        panel.start_recording().await;
        assert!(!panel.autodetect_state().is_pending_confirmation);

        panel
            .handle_event(PushEvent::Listening(ListeningEvent::GreetingRejected {
                transcript: "just chatting".to_string(),
                reason: "Speech did not match greeting patterns".to_string(),
            }))
            .await;

        // The user-initiated session survives: no rollback observed
        assert_eq!(backend.count("reset_session"), 0);
    }

    #[tokio::test]
    async fn test_rejection_without_manual_start_rolls_back() {
        let backend = ScriptedBackend::new();
        let panel = ScribePanel::new(backend.clone() as Arc<dyn CommandGateway>);

        panel
            .handle_event(PushEvent::Listening(ListeningEvent::StartRecording {
                initial_audio_duration_ms: 2_000,
            }))
            .await;
        panel
            .handle_event(PushEvent::Listening(ListeningEvent::GreetingRejected {
                transcript: "just chatting".to_string(),
                reason: "Speech did not match greeting patterns".to_string(),
            }))
            .await;

        assert_eq!(backend.count("reset_session"), 1);
        assert!(!panel.autodetect_state().is_pending_confirmation);
    }

    // ========================================================================
    // Layer 6: Mount lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_mounted_panel_receives_events_and_unmount_unsubscribes() {
        let backend = ScriptedBackend::new();
        let source = TestSource::new();
        let panel = ScribePanel::new(backend as Arc<dyn CommandGateway>);

        panel.mount(source.clone() as Arc<dyn EventSource>).await;
        source.ready().await;

        source
            .emit(
                EventTopic::SessionStatus,
                json!({
                    "state": "recording",
                    "provider": "whisper",
                    "elapsed_ms": 1500,
                    "is_processing_behind": false,
                    "error_message": null,
                    "session_id": "session-1"
                }),
            )
            .await;
        wait_until(|| panel.view().mode == UiMode::Recording).await;

        source
            .emit(
                EventTopic::TranscriptUpdate,
                json!({
                    "finalized_text": "Patient reports cough.",
                    "draft_text": null,
                    "segment_count": 1
                }),
            )
            .await;
        wait_until(|| panel.can_copy()).await;

        panel.unmount();
        wait_until(|| source.unsubscribed.load(Ordering::SeqCst) == EventTopic::ALL.len())
            .await;
    }
}
