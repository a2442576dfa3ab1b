//! Activity Logging Module
//!
//! Provides structured activity logging for auditing and debugging.
//! IMPORTANT: This module must NEVER log PHI (Protected Health Information).
//!
//! What IS logged:
//! - Session IDs, encounter IDs
//! - Timestamps and durations
//! - Event types and outcomes (success/failure)
//! - Word counts and sizes
//! - Model names and settings
//! - Error messages (sanitized)
//!
//! What is NOT logged:
//! - Transcript text
//! - Note content
//! - Patient names or identifiers
//! - Any free-text clinical content

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Guard that must be held for the duration of the application
/// to ensure logs are flushed before exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the activity logging system in the default log directory
///
/// Sets up dual logging:
/// - Console output (human-readable, for development)
/// - File output (JSON, for auditing and analysis)
///
/// Log files are stored in `~/.scribepanel/logs/` with daily rotation.
pub fn init_logging() -> Result<()> {
    init_logging_at(&default_log_directory()?)
}

/// Initialize logging into a specific directory
pub fn init_logging_at(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "activity.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    // File layer: JSON with explicit UTC timestamps
    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true);

    // Console layer: human-readable
    let console_layer = fmt::layer().with_target(true).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("logging already initialized")?;

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Activity logging system initialized"
    );
    Ok(())
}

fn default_log_directory() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".scribepanel").join("logs"))
}

// ============================================================================
// Session Lifecycle Events
// ============================================================================

/// Log session state transition
pub fn log_session_transition(session_id: Option<&str>, from_state: &str, to_state: &str) {
    info!(
        event = "session_transition",
        session_id = session_id,
        from_state = %from_state,
        to_state = %to_state,
        "Session state changed"
    );
}

/// Log session reset
pub fn log_session_reset(session_id: Option<&str>) {
    info!(
        event = "session_reset",
        session_id = session_id,
        "Session reset to idle"
    );
}

// ============================================================================
// Note Generation Events
// ============================================================================

/// Log note generation (without content)
pub fn log_note_generation(
    session_id: Option<&str>,
    transcript_word_count: usize,
    generation_time_ms: u64,
    model: &str,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "note_generation",
            session_id = session_id,
            transcript_word_count = transcript_word_count,
            generation_time_ms = generation_time_ms,
            model = %model,
            success = true,
            "Note generated"
        );
    } else {
        warn!(
            event = "note_generation",
            session_id = session_id,
            transcript_word_count = transcript_word_count,
            generation_time_ms = generation_time_ms,
            model = %model,
            success = false,
            error = error,
            "Note generation failed"
        );
    }
}

// ============================================================================
// EMR Sync Events
// ============================================================================

/// Log encounter sync action ("create", "attach", "multi_create")
pub fn log_encounter_sync(
    action: &str,
    encounter_fhir_id: Option<&str>,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "encounter_sync",
            action = %action,
            encounter_fhir_id = encounter_fhir_id,
            success = true,
            "Encounter sync action"
        );
    } else {
        warn!(
            event = "encounter_sync",
            action = %action,
            encounter_fhir_id = encounter_fhir_id,
            success = false,
            error = error,
            "Encounter sync failed"
        );
    }
}

/// Log authentication action ("login", "logout", "restore")
pub fn log_auth(action: &str, practitioner_id: Option<&str>, success: bool, error: Option<&str>) {
    if success {
        info!(
            event = "auth",
            action = %action,
            practitioner_id = practitioner_id,
            success = true,
            "Authentication action"
        );
    } else {
        warn!(
            event = "auth",
            action = %action,
            practitioner_id = practitioner_id,
            success = false,
            error = error,
            "Authentication failed"
        );
    }
}
