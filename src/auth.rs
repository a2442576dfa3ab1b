//! Authentication and connectivity state for the EMR sync flows.
//!
//! OAuth mechanics (PKCE, token refresh, keychain storage) live in the
//! backend; the panel only tracks the resulting [`AuthState`] and a
//! best-effort connectivity flag. The connectivity probe is a background
//! action: its failures are absorbed after logging and never interrupt the
//! session flow.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::activity_log;
use crate::gateway::{Gateway, GatewayError};

/// Authentication state reported by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub practitioner_id: Option<String>,
    pub practitioner_name: Option<String>,
}

/// Authorization URL for the browser-based login flow
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUrl {
    pub url: String,
    pub state: String,
}

/// Login UI snapshot
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub auth: AuthState,
    pub login_in_progress: bool,
    pub login_error: Option<String>,
    pub connectivity: bool,
}

#[derive(Default)]
struct AuthData {
    auth: AuthState,
    login_in_progress: bool,
    login_error: Option<String>,
    connectivity: bool,
}

pub struct AuthCoordinator {
    gateway: Gateway,
    data: Mutex<AuthData>,
}

impl AuthCoordinator {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            data: Mutex::new(AuthData::default()),
        }
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        let data = self.data.lock().unwrap();
        AuthSnapshot {
            auth: data.auth.clone(),
            login_in_progress: data.login_in_progress,
            login_error: data.login_error.clone(),
            connectivity: data.connectivity,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.data.lock().unwrap().auth.is_authenticated
    }

    pub fn connectivity(&self) -> bool {
        self.data.lock().unwrap().connectivity
    }

    /// Restore a saved session on mount. Background action: failures are
    /// logged and the panel simply stays signed out.
    pub async fn restore_session(&self) {
        match self.gateway.try_restore_session().await {
            Ok(auth) => {
                if auth.is_authenticated {
                    info!(practitioner = ?auth.practitioner_name, "session restored");
                }
                activity_log::log_auth("restore", auth.practitioner_id.as_deref(), true, None);
                self.data.lock().unwrap().auth = auth;
            }
            Err(e) => {
                activity_log::log_auth("restore", None, false, Some(&e.to_string()));
                debug!(error = %e, "session restore failed, staying signed out");
            }
        }
    }

    /// Begin the browser login flow. User-initiated: failure lands in the
    /// login error slot for inline display.
    pub async fn begin_login(&self) -> Option<AuthUrl> {
        {
            let mut data = self.data.lock().unwrap();
            data.login_in_progress = true;
            data.login_error = None;
        }
        match self.gateway.start_auth().await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "login start failed");
                let mut data = self.data.lock().unwrap();
                data.login_in_progress = false;
                data.login_error = Some(e.to_string());
                None
            }
        }
    }

    /// Complete login with the OAuth callback parameters
    pub async fn complete_login(&self, code: &str, state: &str) {
        match self.gateway.handle_auth_callback(code, state).await {
            Ok(auth) => {
                activity_log::log_auth("login", auth.practitioner_id.as_deref(), true, None);
                let mut data = self.data.lock().unwrap();
                data.auth = auth;
                data.login_in_progress = false;
                data.login_error = None;
            }
            Err(e) => {
                activity_log::log_auth("login", None, false, Some(&e.to_string()));
                let mut data = self.data.lock().unwrap();
                data.login_in_progress = false;
                data.login_error = Some(e.to_string());
            }
        }
    }

    /// Cancel a login the user gave up on. Only clears the loading/error UI
    /// state; the network exchange is not ours to abort.
    pub fn cancel_login(&self) {
        let mut data = self.data.lock().unwrap();
        data.login_in_progress = false;
        data.login_error = None;
    }

    pub async fn logout(&self) {
        if let Err(e) = self.gateway.logout().await {
            warn!(error = %e, "logout command failed, clearing local auth anyway");
        }
        activity_log::log_auth("logout", None, true, None);
        self.data.lock().unwrap().auth = AuthState::default();
    }

    /// Best-effort server probe; errors are absorbed as "not connected"
    pub async fn refresh_connectivity(&self) {
        let connected = match self.gateway.check_connection().await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        };
        self.data.lock().unwrap().connectivity = connected;
    }
}

impl Gateway {
    pub async fn get_auth_state(&self) -> Result<AuthState, GatewayError> {
        self.call("medplum_get_auth_state", json!({})).await
    }

    pub async fn try_restore_session(&self) -> Result<AuthState, GatewayError> {
        self.call("medplum_try_restore_session", json!({})).await
    }

    pub async fn start_auth(&self) -> Result<AuthUrl, GatewayError> {
        self.call("medplum_start_auth", json!({})).await
    }

    pub async fn handle_auth_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<AuthState, GatewayError> {
        self.call(
            "medplum_handle_callback",
            json!({ "code": code, "state": state }),
        )
        .await
    }

    pub async fn logout(&self) -> Result<(), GatewayError> {
        self.unit("medplum_logout", json!({})).await
    }

    pub async fn check_connection(&self) -> Result<bool, GatewayError> {
        self.call("medplum_check_connection", json!({})).await
    }
}
