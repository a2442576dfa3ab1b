//! Note generation and remote-encounter sync coordination.
//!
//! One generation and one sync may be in flight per session, enforced here
//! and not merely by disabling buttons. A transcript-only sync that ran
//! first produces the session's `SyncedEncounter`; a later note generation
//! attaches to that encounter instead of creating a second one. Multi-patient
//! results bypass the single-encounter flow and create one patient/encounter
//! pair per detected patient.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::activity_log;
use crate::biomarkers::CoughEvent;
use crate::gateway::{Gateway, GatewayError};
use crate::session::UiMode;

/// SOAP note format style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SoapFormat {
    /// Organize by problem, separate S/O/A/P for each medical problem
    #[default]
    ProblemBased,
    /// Single unified SOAP covering all problems together
    Comprehensive,
}

/// Options forwarded to the note generation command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoapOptions {
    /// Detail level (1-10, where 5 is standard)
    #[serde(default = "default_detail_level")]
    pub detail_level: u8,
    /// SOAP format style
    #[serde(default)]
    pub format: SoapFormat,
    /// Custom instructions from the physician (persisted in settings)
    #[serde(default)]
    pub custom_instructions: String,
    /// Session-specific notes from the clinician (entered during recording)
    #[serde(default)]
    pub session_notes: String,
}

fn default_detail_level() -> u8 {
    5
}

impl Default for SoapOptions {
    fn default() -> Self {
        Self {
            detail_level: 5,
            format: SoapFormat::ProblemBased,
            custom_instructions: String::new(),
            session_notes: String::new(),
        }
    }
}

/// Per-patient note with speaker identification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientNote {
    /// Label for this patient (e.g., "Patient 1", or a custom name)
    pub patient_label: String,
    /// Which speaker this patient was identified as (e.g., "Speaker 1")
    pub speaker_id: String,
    /// The note content for this patient
    pub content: String,
}

/// Result of one generation run; immutable once produced, replaced entirely
/// by regeneration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteGenerationResult {
    /// Individual notes, one per detected patient (1..N)
    pub notes: Vec<PatientNote>,
    /// Which speaker was identified as the physician, if any
    pub physician_speaker: Option<String>,
    /// When the result was generated
    pub generated_at: String,
    /// Which model produced it
    pub model_used: String,
}

impl NoteGenerationResult {
    pub fn is_multi_patient(&self) -> bool {
        self.notes.len() > 1
    }

    /// Content of the sole note in the single-patient case
    pub fn primary_note(&self) -> Option<&str> {
        match self.notes.as_slice() {
            [only] => Some(only.content.as_str()),
            _ => None,
        }
    }
}

/// The session's one remote encounter; at most one per session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedEncounter {
    pub encounter_id: String,
    pub encounter_fhir_id: String,
    pub synced_at: String,
    /// Once true, no further note upload is attempted for this encounter
    pub has_soap: bool,
}

/// Per-document sync flags reported by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(rename = "transcriptSynced", default)]
    pub transcript_synced: bool,
    #[serde(rename = "soapNoteSynced", default)]
    pub soap_note_synced: bool,
    #[serde(rename = "lastSyncTime", default)]
    pub last_sync_time: Option<String>,
}

/// Response of the single-encounter sync command
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "encounterId", default)]
    pub encounter_id: Option<String>,
    #[serde(rename = "encounterFhirId", default)]
    pub encounter_fhir_id: Option<String>,
}

/// Per-patient outcome of a multi-patient sync
#[derive(Debug, Clone, Deserialize)]
pub struct PatientSyncInfo {
    pub patient_label: String,
    pub speaker_id: String,
    pub patient_fhir_id: String,
    pub encounter_fhir_id: String,
    pub has_soap: bool,
}

/// Response of the multi-patient sync command
#[derive(Debug, Clone, Deserialize)]
pub struct MultiPatientSyncResult {
    pub success: bool,
    #[serde(default)]
    pub patients: Vec<PatientSyncInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Session inputs the generation and sync commands need
#[derive(Debug, Clone, Default)]
pub struct SessionNoteContext {
    pub transcript: String,
    pub session_id: Option<String>,
    pub session_duration_ms: u64,
    /// Recent audio events forwarded to the generation prompt
    pub audio_events: Vec<CoughEvent>,
}

/// Combined sync/generation status for the indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinedStatus {
    Idle,
    Syncing,
    Error,
    Success,
}

/// Display snapshot of the coordinator
#[derive(Debug, Clone, Default)]
pub struct NoteSyncSnapshot {
    pub generating: bool,
    pub syncing: bool,
    pub result: Option<NoteGenerationResult>,
    pub synced: Option<SyncedEncounter>,
    pub generation_error: Option<String>,
    pub sync_error: Option<String>,
}

#[derive(Default)]
struct NoteSyncData {
    generating: bool,
    syncing: bool,
    result: Option<NoteGenerationResult>,
    synced: Option<SyncedEncounter>,
    generation_error: Option<String>,
    sync_error: Option<String>,
    /// Forces the indicator to idle until the next sync/generation starts
    dismissed: bool,
}

enum SyncPlan {
    MultiPatient,
    Attach { encounter_fhir_id: String },
    Create,
}

/// Clones share the same underlying state; the auto triggers hand a clone to
/// the spawned task so the dispatch loop is never blocked on backend work.
#[derive(Clone)]
pub struct NoteSyncCoordinator {
    gateway: Gateway,
    data: Arc<Mutex<NoteSyncData>>,
}

impl NoteSyncCoordinator {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            data: Arc::new(Mutex::new(NoteSyncData::default())),
        }
    }

    pub fn snapshot(&self) -> NoteSyncSnapshot {
        let data = self.data.lock().unwrap();
        NoteSyncSnapshot {
            generating: data.generating,
            syncing: data.syncing,
            result: data.result.clone(),
            synced: data.synced.clone(),
            generation_error: data.generation_error.clone(),
            sync_error: data.sync_error.clone(),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.data.lock().unwrap().generating
    }

    pub fn is_syncing(&self) -> bool {
        self.data.lock().unwrap().syncing
    }

    pub fn result(&self) -> Option<NoteGenerationResult> {
        self.data.lock().unwrap().result.clone()
    }

    pub fn synced_encounter(&self) -> Option<SyncedEncounter> {
        self.data.lock().unwrap().synced.clone()
    }

    /// Combined indicator status, evaluated in priority order
    pub fn combined_status(&self) -> CombinedStatus {
        let data = self.data.lock().unwrap();
        if data.generating || data.syncing {
            CombinedStatus::Syncing
        } else if data.dismissed {
            CombinedStatus::Idle
        } else if data.generation_error.is_some() || data.sync_error.is_some() {
            CombinedStatus::Error
        } else if data.result.is_some() || data.synced.is_some() {
            CombinedStatus::Success
        } else {
            CombinedStatus::Idle
        }
    }

    /// Dismiss the indicator. Retained errors clear with it; the flag holds
    /// until the next sync or generation starts.
    pub fn dismiss(&self) {
        let mut data = self.data.lock().unwrap();
        data.dismissed = true;
        data.generation_error = None;
        data.sync_error = None;
    }

    /// Drop all per-session results (session reset)
    pub fn clear(&self) {
        *self.data.lock().unwrap() = NoteSyncData::default();
    }

    /// User-initiated generation. Single-flight: a second call while one is
    /// outstanding is refused.
    pub async fn generate(
        &self,
        ctx: SessionNoteContext,
        options: SoapOptions,
        authenticated: bool,
    ) {
        {
            let mut data = self.data.lock().unwrap();
            if data.generating {
                warn!("note generation already in flight, ignoring request");
                return;
            }
            data.generating = true;
            data.dismissed = false;
            data.generation_error = None;
        }
        self.run_generation(ctx, options, authenticated).await;
    }

    /// Fire generation when a completed session with a transcript is on
    /// screen and nothing ran yet. The busy flag is taken synchronously so a
    /// repeated trigger (e.g. a duplicated Completed event) cannot start a
    /// second run.
    pub fn auto_generate_if_due(
        &self,
        mode: UiMode,
        connectivity: bool,
        authenticated: bool,
        ctx: SessionNoteContext,
        options: SoapOptions,
    ) {
        if mode != UiMode::Review || !connectivity || ctx.transcript.trim().is_empty() {
            return;
        }
        {
            let mut data = self.data.lock().unwrap();
            if data.generating || data.result.is_some() || data.generation_error.is_some() {
                return;
            }
            data.generating = true;
            data.dismissed = false;
        }
        info!("auto-generating note for completed session");
        let this = self.clone();
        tokio::spawn(async move {
            this.run_generation(ctx, options, authenticated).await;
        });
    }

    /// Fire a transcript-only sync when a completed session is on screen,
    /// the user is signed in, and nothing was synced yet. A later note
    /// generation then attaches to the encounter created here.
    pub fn auto_sync_if_due(
        &self,
        mode: UiMode,
        authenticated: bool,
        auto_sync_enabled: bool,
        ctx: SessionNoteContext,
    ) {
        if mode != UiMode::Review
            || !authenticated
            || !auto_sync_enabled
            || ctx.transcript.trim().is_empty()
        {
            return;
        }
        {
            let mut data = self.data.lock().unwrap();
            if data.syncing || data.synced.is_some() || data.sync_error.is_some() {
                return;
            }
            data.syncing = true;
            data.dismissed = false;
        }
        info!("auto-syncing transcript for completed session");
        let this = self.clone();
        tokio::spawn(async move {
            this.run_transcript_sync(ctx).await;
        });
    }

    /// Run a generation whose busy flag is already taken
    async fn run_generation(&self, ctx: SessionNoteContext, options: SoapOptions, authenticated: bool) {
        let started = Instant::now();
        let word_count = ctx.transcript.split_whitespace().count();
        let outcome = self.gateway.generate_soap_note(&ctx, &options).await;

        match outcome {
            Ok(result) => {
                activity_log::log_note_generation(
                    ctx.session_id.as_deref(),
                    word_count,
                    started.elapsed().as_millis() as u64,
                    &result.model_used,
                    true,
                    None,
                );
                info!(
                    patients = result.notes.len(),
                    model = %result.model_used,
                    "note generation complete"
                );
                {
                    let mut data = self.data.lock().unwrap();
                    data.result = Some(result.clone());
                    data.generating = false;
                }
                if authenticated {
                    self.dispatch_post_generation_sync(&ctx, &result).await;
                } else {
                    debug!("not authenticated, skipping note sync");
                }
            }
            Err(e) => {
                activity_log::log_note_generation(
                    ctx.session_id.as_deref(),
                    word_count,
                    started.elapsed().as_millis() as u64,
                    "unknown",
                    false,
                    Some(&e.to_string()),
                );
                warn!(error = %e, "note generation failed");
                let mut data = self.data.lock().unwrap();
                data.generating = false;
                data.generation_error = Some(e.to_string());
            }
        }
    }

    /// Decide where the fresh result goes: multi-patient sync, attach to the
    /// session's encounter, create one, or nothing. Runs once per successful
    /// generation.
    async fn dispatch_post_generation_sync(
        &self,
        ctx: &SessionNoteContext,
        result: &NoteGenerationResult,
    ) {
        let plan = {
            let mut data = self.data.lock().unwrap();
            if data.syncing {
                warn!("sync already in flight, note sync skipped");
                None
            } else if result.is_multi_patient() {
                data.syncing = true;
                data.dismissed = false;
                data.sync_error = None;
                Some(SyncPlan::MultiPatient)
            } else {
                match &data.synced {
                    Some(encounter) if encounter.has_soap => {
                        debug!("encounter already carries a note, nothing to sync");
                        None
                    }
                    Some(encounter) => {
                        let id = encounter.encounter_fhir_id.clone();
                        data.syncing = true;
                        data.dismissed = false;
                        data.sync_error = None;
                        Some(SyncPlan::Attach {
                            encounter_fhir_id: id,
                        })
                    }
                    None => {
                        data.syncing = true;
                        data.dismissed = false;
                        data.sync_error = None;
                        Some(SyncPlan::Create)
                    }
                }
            }
        };

        match plan {
            Some(SyncPlan::MultiPatient) => self.run_multi_patient_sync(ctx, result).await,
            Some(SyncPlan::Attach { encounter_fhir_id }) => {
                self.run_attach_note(&encounter_fhir_id, result).await
            }
            Some(SyncPlan::Create) => self.run_create_with_note(ctx, result).await,
            None => {}
        }
    }

    async fn run_multi_patient_sync(&self, ctx: &SessionNoteContext, result: &NoteGenerationResult) {
        info!(patients = result.notes.len(), "multi-patient sync");
        let outcome = self.gateway.multi_patient_quick_sync(ctx, result).await;
        let mut data = self.data.lock().unwrap();
        data.syncing = false;
        match outcome {
            Ok(r) if r.success => {
                activity_log::log_encounter_sync("multi_create", None, true, None);
            }
            Ok(r) => {
                let message = r.error.unwrap_or_else(|| "multi-patient sync failed".to_string());
                activity_log::log_encounter_sync("multi_create", None, false, Some(&message));
                data.sync_error = Some(message);
            }
            Err(e) => {
                activity_log::log_encounter_sync("multi_create", None, false, Some(&e.to_string()));
                data.sync_error = Some(e.to_string());
            }
        }
    }

    async fn run_attach_note(&self, encounter_fhir_id: &str, result: &NoteGenerationResult) {
        info!(encounter_fhir_id, "attaching note to synced encounter");
        let note = result.primary_note().unwrap_or_default().to_string();
        let outcome = self.gateway.add_soap_to_encounter(encounter_fhir_id, &note).await;
        let mut data = self.data.lock().unwrap();
        data.syncing = false;
        match outcome {
            Ok(true) => {
                activity_log::log_encounter_sync("attach", Some(encounter_fhir_id), true, None);
                if let Some(encounter) = data.synced.as_mut() {
                    encounter.has_soap = true;
                }
            }
            Ok(false) => {
                let message = "backend declined note attach".to_string();
                activity_log::log_encounter_sync("attach", Some(encounter_fhir_id), false, Some(&message));
                data.sync_error = Some(message);
            }
            Err(e) => {
                activity_log::log_encounter_sync("attach", Some(encounter_fhir_id), false, Some(&e.to_string()));
                data.sync_error = Some(e.to_string());
            }
        }
    }

    async fn run_create_with_note(&self, ctx: &SessionNoteContext, result: &NoteGenerationResult) {
        info!("creating encounter with note");
        let note = result.primary_note().map(str::to_string);
        let outcome = self.gateway.quick_sync(ctx, note.as_deref()).await;
        self.record_single_sync_outcome(outcome, true);
    }

    /// Transcript-only sync whose busy flag is already taken
    async fn run_transcript_sync(&self, ctx: SessionNoteContext) {
        let outcome = self.gateway.quick_sync(&ctx, None).await;
        self.record_single_sync_outcome(outcome, false);
    }

    fn record_single_sync_outcome(&self, outcome: Result<SyncResult, GatewayError>, has_soap: bool) {
        let mut data = self.data.lock().unwrap();
        data.syncing = false;
        match outcome {
            Ok(r) if r.success => {
                let encounter = SyncedEncounter {
                    encounter_id: r.encounter_id.unwrap_or_default(),
                    encounter_fhir_id: r.encounter_fhir_id.unwrap_or_default(),
                    synced_at: Utc::now().to_rfc3339(),
                    has_soap,
                };
                activity_log::log_encounter_sync(
                    "create",
                    Some(&encounter.encounter_fhir_id),
                    true,
                    None,
                );
                data.synced = Some(encounter);
            }
            Ok(r) => {
                let message = r.error.unwrap_or_else(|| "sync failed".to_string());
                activity_log::log_encounter_sync("create", None, false, Some(&message));
                data.sync_error = Some(message);
            }
            Err(e) => {
                activity_log::log_encounter_sync("create", None, false, Some(&e.to_string()));
                data.sync_error = Some(e.to_string());
            }
        }
    }
}

impl Gateway {
    pub async fn generate_soap_note(
        &self,
        ctx: &SessionNoteContext,
        options: &SoapOptions,
    ) -> Result<NoteGenerationResult, GatewayError> {
        self.call(
            "generate_soap_note",
            json!({
                "transcript": ctx.transcript,
                "audioEvents": ctx.audio_events,
                "options": options,
                "sessionId": ctx.session_id,
            }),
        )
        .await
    }

    pub async fn quick_sync(
        &self,
        ctx: &SessionNoteContext,
        soap_note: Option<&str>,
    ) -> Result<SyncResult, GatewayError> {
        self.call(
            "medplum_quick_sync",
            json!({
                "transcript": ctx.transcript,
                "soapNote": soap_note,
                "sessionDurationMs": ctx.session_duration_ms,
            }),
        )
        .await
    }

    pub async fn multi_patient_quick_sync(
        &self,
        ctx: &SessionNoteContext,
        result: &NoteGenerationResult,
    ) -> Result<MultiPatientSyncResult, GatewayError> {
        self.call(
            "medplum_multi_patient_quick_sync",
            json!({
                "transcript": ctx.transcript,
                "soapResult": result,
                "sessionDurationMs": ctx.session_duration_ms,
            }),
        )
        .await
    }

    pub async fn add_soap_to_encounter(
        &self,
        encounter_fhir_id: &str,
        soap_note: &str,
    ) -> Result<bool, GatewayError> {
        self.call(
            "medplum_add_soap_to_encounter",
            json!({
                "encounterFhirId": encounter_fhir_id,
                "soapNote": soap_note,
            }),
        )
        .await
    }
}
