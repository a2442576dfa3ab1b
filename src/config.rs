//! Panel settings: types, defaults, and load/save through the backend.
//!
//! Settings persistence belongs to the backend (`get_settings` /
//! `set_settings`); the panel holds a working copy and never touches disk
//! itself. Unknown or missing fields fall back to defaults so older
//! backends keep working.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::gateway::{Gateway, GatewayError};
use crate::notegen::SoapOptions;

/// Panel settings exposed to the embedding UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Start recording automatically when a greeting is detected
    #[serde(default = "default_auto_start_enabled")]
    pub auto_start_enabled: bool,

    /// Sync the transcript to the EMR as soon as a session completes
    #[serde(default = "default_auto_sync_enabled")]
    pub auto_sync_enabled: bool,

    /// Preferred capture device; `None` uses the system default
    #[serde(default)]
    pub input_device_id: Option<String>,

    /// Note generation options
    #[serde(default)]
    pub soap_options: SoapOptions,
}

fn default_auto_start_enabled() -> bool {
    true
}

fn default_auto_sync_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_start_enabled: default_auto_start_enabled(),
            auto_sync_enabled: default_auto_sync_enabled(),
            input_device_id: None,
            soap_options: SoapOptions::default(),
        }
    }
}

impl Gateway {
    /// Load settings, falling back to defaults when the backend has none
    pub async fn get_settings(&self) -> Result<Settings, GatewayError> {
        self.call("get_settings", json!({})).await
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<(), GatewayError> {
        debug!("saving settings");
        self.unit("set_settings", json!({ "settings": settings }))
            .await
    }
}
