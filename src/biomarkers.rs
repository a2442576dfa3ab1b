//! Consumer-side biomarker and audio-quality payloads.
//!
//! The backend computes these during recording and pushes them on the
//! `biomarker_update` and `audio_quality` topics. The panel never derives or
//! merges them; each event replaces the previous snapshot wholesale.

use serde::{Deserialize, Serialize};

/// Audio event detected during recording (cough, laugh, sneeze, etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoughEvent {
    /// Timestamp in milliseconds from start of recording
    pub timestamp_ms: u64,
    /// Duration of the event in milliseconds
    pub duration_ms: u32,
    /// Model confidence score
    pub confidence: f32,
    /// Event label (e.g., "Cough", "Throat clearing")
    pub label: String,
}

/// Per-speaker biomarker metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerBiomarkers {
    /// Speaker identifier (e.g., "Speaker 1", "Speaker 2")
    pub speaker_id: String,
    /// Mean vitality (F0 std dev in Hz) for this speaker
    pub vitality_mean: Option<f32>,
    /// Mean stability (CPP in dB) for this speaker
    pub stability_mean: Option<f32>,
    /// Total talk time in ms
    pub talk_time_ms: u64,
    /// Number of turns for this speaker
    pub turn_count: u32,
    /// Whether this speaker is an enrolled clinician
    #[serde(default)]
    pub is_clinician: bool,
}

/// Session-level biomarker rollup pushed on `biomarker_update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BiomarkerUpdate {
    /// Total cough count in session
    pub cough_count: u32,
    /// Coughs per minute
    pub cough_rate_per_min: f32,
    /// Number of speaker turns
    pub turn_count: u32,
    /// Average turn duration (ms)
    pub avg_turn_duration_ms: f32,
    /// Talk time ratio (patient / clinician, if 2 speakers)
    pub talk_time_ratio: Option<f32>,
    /// Session mean vitality (F0 std dev in Hz), all speakers combined
    pub vitality_session_mean: Option<f32>,
    /// Session mean stability (CPP in dB), all speakers combined
    pub stability_session_mean: Option<f32>,
    /// Per-speaker biomarker metrics
    #[serde(default)]
    pub speaker_metrics: Vec<SpeakerBiomarkers>,
    /// Recent audio events (last 10)
    #[serde(default)]
    pub recent_events: Vec<CoughEvent>,
}

/// Audio quality snapshot pushed on `audio_quality`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioQualitySnapshot {
    pub timestamp_ms: u64,

    // Per chunk
    pub peak_db: f32,
    pub rms_db: f32,
    pub clipped_samples: u32,
    pub clipped_ratio: f32,

    // Running estimates
    pub noise_floor_db: f32,
    pub snr_db: f32,
    pub silence_ratio: f32,

    // Counters
    pub dropout_count: u32,
    pub total_clipped: u32,
    pub total_samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_biomarker_update_deserializes_sparse_payload() {
        // Older backends omit the per-speaker and event arrays
        let json = serde_json::json!({
            "cough_count": 2,
            "cough_rate_per_min": 0.5,
            "turn_count": 14,
            "avg_turn_duration_ms": 4200.0,
            "talk_time_ratio": null,
            "vitality_session_mean": 21.3,
            "stability_session_mean": null
        });

        let update: BiomarkerUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(update.cough_count, 2);
        assert!(update.speaker_metrics.is_empty());
        assert!(update.recent_events.is_empty());
    }

    #[test]
    fn test_audio_quality_roundtrip() {
        let snapshot = AudioQualitySnapshot {
            timestamp_ms: 12_000,
            peak_db: -3.1,
            rms_db: -18.4,
            snr_db: 22.0,
            ..Default::default()
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        let back: AudioQualitySnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.timestamp_ms, 12_000);
        assert_eq!(back.snr_db, 22.0);
    }
}
