//! Panel orchestrator: wires the controller and coordinators together.
//!
//! All push events are applied on one dispatch loop, so handlers never
//! interleave. After every applied event (and every settings change) a
//! level-triggered reconcile pass converges the listening state and the
//! auto sync/generation triggers, whichever input changed.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthCoordinator;
use crate::autodetect::{AutoDetectCoordinator, AutoDetectionState};
use crate::chat::ChatCoordinator;
use crate::config::Settings;
use crate::events::{EventSource, PushEvent, SubscriptionManager};
use crate::gateway::{CommandGateway, Gateway, GatewayError};
use crate::notegen::{CombinedStatus, NoteSyncCoordinator, SessionNoteContext};
use crate::session::{SessionController, SessionView, UiMode};

/// Microphone permission probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrophonePermissionStatus {
    pub status: String,
    pub authorized: bool,
    pub message: String,
}

/// The state the dispatch loop reacts over. Clones share everything, so the
/// spawned loop and the panel facade see the same session scope.
#[derive(Clone)]
struct PanelCore {
    session: Arc<SessionController>,
    autodetect: Arc<AutoDetectCoordinator>,
    notes: NoteSyncCoordinator,
    auth: Arc<AuthCoordinator>,
    settings: Arc<Mutex<Settings>>,
}

impl PanelCore {
    /// Apply one push event, then reconcile
    async fn handle_event(&self, event: PushEvent) {
        match event {
            PushEvent::SessionStatus(status) => self.session.apply_status(status),
            PushEvent::Transcript(update) => self.session.apply_transcript(update),
            PushEvent::Biomarker(update) => self.session.apply_biomarkers(update),
            PushEvent::AudioQuality(snapshot) => self.session.apply_audio_quality(snapshot),
            PushEvent::Listening(listening) => {
                self.autodetect.handle_event(listening, &self.session).await
            }
        }
        self.reconcile().await;
    }

    /// Level-triggered convergence pass. Listening follows the UI mode and
    /// the auto-start toggle; the auto triggers take their busy flags
    /// synchronously, so re-running this on every state change is safe.
    async fn reconcile(&self) {
        let view = self.session.snapshot();
        let settings = self.settings.lock().unwrap().clone();

        let should_listen = view.mode == UiMode::Ready && settings.auto_start_enabled;
        self.autodetect.sync_listening(should_listen).await;

        let authenticated = self.auth.is_authenticated();
        let connectivity = self.auth.connectivity();
        let ctx = note_context(&view);
        self.notes.auto_sync_if_due(
            view.mode,
            authenticated,
            settings.auto_sync_enabled,
            ctx.clone(),
        );
        self.notes.auto_generate_if_due(
            view.mode,
            connectivity,
            authenticated,
            ctx,
            settings.soap_options.clone(),
        );
    }
}

fn note_context(view: &SessionView) -> SessionNoteContext {
    SessionNoteContext {
        transcript: view.edited_transcript.clone(),
        session_id: view.status.session_id.clone(),
        session_duration_ms: view.display_elapsed_ms,
        audio_events: view
            .biomarkers
            .as_ref()
            .map(|b| b.recent_events.clone())
            .unwrap_or_default(),
    }
}

/// The persistent scribe panel: one instance per embedding window
pub struct ScribePanel {
    gateway: Gateway,
    core: PanelCore,
    chat: ChatCoordinator,
    /// Dedicated dismissable slot for microphone permission denials,
    /// separate from generic session errors
    permission_error: Mutex<Option<String>>,
    subscriptions: Mutex<Option<SubscriptionManager>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl ScribePanel {
    pub fn new(backend: Arc<dyn CommandGateway>) -> Self {
        let gateway = Gateway::new(backend);
        Self {
            core: PanelCore {
                session: Arc::new(SessionController::new(gateway.clone())),
                autodetect: Arc::new(AutoDetectCoordinator::new(gateway.clone())),
                notes: NoteSyncCoordinator::new(gateway.clone()),
                auth: Arc::new(AuthCoordinator::new(gateway.clone())),
                settings: Arc::new(Mutex::new(Settings::default())),
            },
            chat: ChatCoordinator::new(gateway.clone()),
            gateway,
            permission_error: Mutex::new(None),
            subscriptions: Mutex::new(None),
            dispatch: Mutex::new(None),
        }
    }

    // =====================
    // Component access
    // =====================

    pub fn session(&self) -> &SessionController {
        &self.core.session
    }

    pub fn notes(&self) -> &NoteSyncCoordinator {
        &self.core.notes
    }

    pub fn auth(&self) -> &AuthCoordinator {
        &self.core.auth
    }

    pub fn chat(&self) -> &ChatCoordinator {
        &self.chat
    }

    pub fn view(&self) -> SessionView {
        self.core.session.snapshot()
    }

    pub fn autodetect_state(&self) -> AutoDetectionState {
        self.core.autodetect.state()
    }

    pub fn settings(&self) -> Settings {
        self.core.settings.lock().unwrap().clone()
    }

    // =====================
    // Lifecycle
    // =====================

    /// Mount the panel: open one subscription per topic, start the dispatch
    /// loop, and bootstrap settings/auth/connectivity in the background.
    pub async fn mount(&self, source: Arc<dyn EventSource>) {
        self.unmount();
        info!(mount_id = %uuid::Uuid::new_v4(), "mounting panel");

        let (subscriptions, mut rx) = SubscriptionManager::open(source);
        *self.subscriptions.lock().unwrap() = Some(subscriptions);
        let core = self.core.clone();
        *self.dispatch.lock().unwrap() = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                core.handle_event(event).await;
            }
            debug!("event dispatch loop ended");
        }));

        self.load_settings().await;
        self.core.auth.restore_session().await;
        self.core.auth.refresh_connectivity().await;
        self.core.reconcile().await;
    }

    /// Tear the panel down. Safe to call at any time, including while
    /// subscription setup is still pending.
    pub fn unmount(&self) {
        if let Some(mut subscriptions) = self.subscriptions.lock().unwrap().take() {
            subscriptions.close();
        }
        if let Some(dispatch) = self.dispatch.lock().unwrap().take() {
            dispatch.abort();
        }
    }

    /// Apply one push event, then reconcile. The mounted dispatch loop calls
    /// this internally; it is public for embedding shells that bridge their
    /// own event plumbing.
    pub async fn handle_event(&self, event: PushEvent) {
        self.core.handle_event(event).await;
    }

    /// Re-run the level-triggered convergence pass
    pub async fn reconcile(&self) {
        self.core.reconcile().await;
    }

    // =====================
    // User actions
    // =====================

    /// Manual start. Clears any pending optimistic confirmation before the
    /// command goes out, so a rejection landing afterwards cannot tear the
    /// session down.
    pub async fn start_recording(&self) {
        match self.gateway.check_microphone_permission().await {
            Ok(permission) if !permission.authorized => {
                warn!(status = %permission.status, "microphone permission denied");
                *self.permission_error.lock().unwrap() = Some(permission.message);
                return;
            }
            Ok(_) => {}
            // The preflight is advisory; the backend refuses the session
            // itself when capture is truly unavailable.
            Err(e) => debug!(error = %e, "permission preflight unavailable"),
        }

        if self.core.autodetect.clear_pending() {
            debug!("manual start takes over a pending optimistic session");
        }
        let device_id = self.core.settings.lock().unwrap().input_device_id.clone();
        self.core.session.start(device_id.as_deref()).await;
        self.core.reconcile().await;
    }

    pub async fn stop_recording(&self) {
        self.core.session.stop().await;
        self.core.reconcile().await;
    }

    /// Reset the whole session scope: backend session, local snapshots, and
    /// the note/sync results.
    pub async fn reset(&self) {
        self.core.autodetect.clear_pending();
        self.core.session.reset().await;
        self.core.notes.clear();
        self.core.reconcile().await;
    }

    /// User-initiated note generation for the current transcript
    pub async fn generate_note(&self) {
        let view = self.core.session.snapshot();
        let ctx = note_context(&view);
        if ctx.transcript.trim().is_empty() {
            warn!("no transcript to generate a note from");
            return;
        }
        let options = self.core.settings.lock().unwrap().soap_options.clone();
        let authenticated = self.core.auth.is_authenticated();
        self.core.notes.generate(ctx, options, authenticated).await;
    }

    pub fn set_edited_transcript(&self, text: String) {
        self.core.session.set_edited_transcript(text);
    }

    pub async fn send_chat_message(&self, text: impl Into<String>) {
        self.chat.send(text).await;
    }

    /// Save settings through the backend. User-initiated: the error is
    /// returned for inline display instead of being absorbed.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), GatewayError> {
        self.gateway.set_settings(&settings).await?;
        self.core
            .autodetect
            .set_input_device(settings.input_device_id.clone());
        *self.core.settings.lock().unwrap() = settings;
        self.core.reconcile().await;
        Ok(())
    }

    async fn load_settings(&self) {
        match self.gateway.get_settings().await {
            Ok(settings) => {
                self.core
                    .autodetect
                    .set_input_device(settings.input_device_id.clone());
                *self.core.settings.lock().unwrap() = settings;
            }
            Err(e) => debug!(error = %e, "settings unavailable, using defaults"),
        }
    }

    // =====================
    // Derived flags
    // =====================

    pub fn can_start(&self) -> bool {
        self.core.session.snapshot().mode == UiMode::Ready
    }

    pub fn can_copy(&self) -> bool {
        !self
            .core
            .session
            .snapshot()
            .edited_transcript
            .trim()
            .is_empty()
    }

    pub fn combined_sync_status(&self) -> CombinedStatus {
        self.core.notes.combined_status()
    }

    pub fn permission_error(&self) -> Option<String> {
        self.permission_error.lock().unwrap().clone()
    }

    pub fn dismiss_permission_error(&self) {
        *self.permission_error.lock().unwrap() = None;
    }

    pub fn dismiss_sync_status(&self) {
        self.core.notes.dismiss();
    }
}

impl Drop for ScribePanel {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl Gateway {
    pub async fn check_microphone_permission(
        &self,
    ) -> Result<MicrophonePermissionStatus, GatewayError> {
        self.call("check_microphone_permission", json!({})).await
    }
}
