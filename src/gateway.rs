//! Command gateway to the capture/transcription backend.
//!
//! The backend owns audio capture, transcription, note generation, and the
//! remote EMR connection. This module only models the request/response
//! channel: one named command in, one JSON response out. Typed wrappers for
//! the individual commands live with the modules that own their payloads
//! (session, autodetect, notegen, auth, chat, config).

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the command channel
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("command channel unavailable: {0}")]
    Transport(String),

    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GatewayError {
    /// Permission failures get a dedicated, dismissable UI slot
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, GatewayError::PermissionDenied(_))
    }
}

/// Raw command channel to the backend.
///
/// Implementations must never panic on unknown commands; they return
/// [`GatewayError::Command`] and the caller decides whether the failure is
/// user-visible or absorbed.
#[async_trait]
pub trait CommandGateway: Send + Sync + 'static {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, GatewayError>;
}

/// Cloneable handle over the raw channel with decode helpers
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<dyn CommandGateway>,
}

impl Gateway {
    pub fn new(inner: Arc<dyn CommandGateway>) -> Self {
        Self { inner }
    }

    /// Invoke a command and decode the response
    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        command: &str,
        args: Value,
    ) -> Result<T, GatewayError> {
        let response = self.inner.invoke(command, args).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Invoke a command whose response carries no payload
    pub(crate) async fn unit(&self, command: &str, args: Value) -> Result<(), GatewayError> {
        self.inner.invoke(command, args).await?;
        Ok(())
    }
}
