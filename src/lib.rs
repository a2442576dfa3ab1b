//! # Scribe Panel Orchestration Core
//!
//! This crate is the session orchestration layer of the clinical scribe
//! panel: it drives the capture/transcription backend through a command
//! channel, reconciles its push events into one coherent UI model, and
//! coordinates note generation and EMR sync.
//!
//! ## Architecture
//!
//! - [`gateway`] - Async command channel to the backend
//! - [`events`] - Push-event topics, decoding, and subscription lifetime
//! - [`session`] - Recording session state machine and elapsed-time ticker
//! - [`autodetect`] - Optimistic auto-start on detected speech
//! - [`notegen`] - Note generation and remote-encounter sync
//! - [`auth`] - Authentication and connectivity state
//! - [`chat`] - Clinical assistant chat
//! - [`config`] - Panel settings
//! - [`panel`] - Top-level wiring and the reconcile pass
//!
//! ## Usage
//!
//! The embedding shell provides a [`CommandGateway`] and an
//! [`EventSource`], constructs a [`ScribePanel`], and mounts it:
//!
//! ```no_run
//! # async fn example(
//! #     backend: std::sync::Arc<dyn scribe_panel::CommandGateway>,
//! #     source: std::sync::Arc<dyn scribe_panel::EventSource>,
//! # ) {
//! let panel = scribe_panel::ScribePanel::new(backend);
//! panel.mount(source).await;
//! # }
//! ```

pub mod activity_log;
pub mod auth;
pub mod autodetect;
pub mod biomarkers;
pub mod chat;
pub mod config;
pub mod events;
pub mod gateway;
pub mod notegen;
pub mod panel;
pub mod session;

#[cfg(test)]
mod orchestration_tests;

pub use events::{EventSource, EventTopic, PushEvent, SubscriptionToken};
pub use gateway::{CommandGateway, Gateway, GatewayError};
pub use panel::ScribePanel;
pub use session::{SessionState, SessionStatus, UiMode};
