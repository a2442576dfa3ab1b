//! Push-event channel: topics, payload decoding, and subscription lifetime.
//!
//! The backend delivers JSON payloads on named topics, in emission order per
//! topic and with no defined order across topics. Each topic gets a bounded
//! channel; a decode pump per topic forwards typed events into one merged
//! queue that the panel drains serially, so handlers never interleave.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::autodetect::ListeningEvent;
use crate::biomarkers::{AudioQualitySnapshot, BiomarkerUpdate};
use crate::session::{SessionStatus, TranscriptUpdate};

/// Capacity of each per-topic payload channel
pub const TOPIC_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the merged dispatch queue
const DISPATCH_CAPACITY: usize = 64;

/// Named push-event topics delivered by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    SessionStatus,
    TranscriptUpdate,
    BiomarkerUpdate,
    AudioQuality,
    ListeningEvent,
}

impl EventTopic {
    pub const ALL: [EventTopic; 5] = [
        EventTopic::SessionStatus,
        EventTopic::TranscriptUpdate,
        EventTopic::BiomarkerUpdate,
        EventTopic::AudioQuality,
        EventTopic::ListeningEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::SessionStatus => "session_status",
            EventTopic::TranscriptUpdate => "transcript_update",
            EventTopic::BiomarkerUpdate => "biomarker_update",
            EventTopic::AudioQuality => "audio_quality",
            EventTopic::ListeningEvent => "listening_event",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded push event, tagged by its topic
#[derive(Debug, Clone)]
pub enum PushEvent {
    SessionStatus(SessionStatus),
    Transcript(TranscriptUpdate),
    Biomarker(BiomarkerUpdate),
    AudioQuality(AudioQualitySnapshot),
    Listening(ListeningEvent),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("subscription to {topic} failed: {message}")]
    Failed { topic: &'static str, message: String },
}

/// Handle for one topic subscription. The unsubscribe closure runs exactly
/// once, on `cancel` or on drop, whichever comes first.
pub struct SubscriptionToken {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionToken {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("armed", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Source of push events (the backend bridge).
///
/// Payloads for one topic must be delivered to `sink` in emission order.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn subscribe(
        &self,
        topic: EventTopic,
        sink: mpsc::Sender<Value>,
    ) -> Result<SubscriptionToken, SubscribeError>;
}

enum TopicSlot {
    Pending,
    Active(SubscriptionToken),
    Closed,
}

/// Opens one subscription per topic on mount and guarantees that every
/// token is invoked exactly once on teardown, even when the subscribe call
/// has not resolved yet by then.
pub struct SubscriptionManager {
    slots: Arc<Mutex<Vec<TopicSlot>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl SubscriptionManager {
    /// Subscribe to all topics and return the merged, decoded event queue.
    /// Subscription failures are logged and not retried; the backend
    /// guarantees eventual delivery once it is available.
    pub fn open(source: Arc<dyn EventSource>) -> (Self, mpsc::Receiver<PushEvent>) {
        let (out_tx, out_rx) = mpsc::channel(DISPATCH_CAPACITY);
        let slots: Arc<Mutex<Vec<TopicSlot>>> = Arc::new(Mutex::new(
            EventTopic::ALL.iter().map(|_| TopicSlot::Pending).collect(),
        ));
        let mut pumps = Vec::with_capacity(EventTopic::ALL.len());

        for topic in EventTopic::ALL {
            let (raw_tx, mut raw_rx) = mpsc::channel::<Value>(TOPIC_CHANNEL_CAPACITY);

            let out = out_tx.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(payload) = raw_rx.recv().await {
                    match decode(topic, payload) {
                        Ok(event) => {
                            if out.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "dropping undecodable event payload");
                        }
                    }
                }
            }));

            let source = Arc::clone(&source);
            let slots = Arc::clone(&slots);
            tokio::spawn(async move {
                match source.subscribe(topic, raw_tx).await {
                    Ok(token) => {
                        let stale = {
                            let mut slots = slots.lock().unwrap();
                            let slot = &mut slots[topic.index()];
                            if matches!(slot, TopicSlot::Closed) {
                                Some(token)
                            } else {
                                *slot = TopicSlot::Active(token);
                                None
                            }
                        };
                        if let Some(token) = stale {
                            debug!(topic = %topic, "subscription resolved after teardown, cancelling");
                            token.cancel();
                        }
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "subscription failed");
                    }
                }
            });
        }

        (Self { slots, pumps }, out_rx)
    }

    /// Tear down all subscriptions. Active tokens are cancelled now; pending
    /// ones the moment their subscribe call resolves.
    pub fn close(&mut self) {
        let tokens: Vec<SubscriptionToken> = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, TopicSlot::Closed) {
                    TopicSlot::Active(token) => Some(token),
                    TopicSlot::Pending | TopicSlot::Closed => None,
                })
                .collect()
        };
        for token in tokens {
            token.cancel();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode(topic: EventTopic, payload: Value) -> Result<PushEvent, serde_json::Error> {
    Ok(match topic {
        EventTopic::SessionStatus => PushEvent::SessionStatus(serde_json::from_value(payload)?),
        EventTopic::TranscriptUpdate => PushEvent::Transcript(serde_json::from_value(payload)?),
        EventTopic::BiomarkerUpdate => PushEvent::Biomarker(serde_json::from_value(payload)?),
        EventTopic::AudioQuality => PushEvent::AudioQuality(serde_json::from_value(payload)?),
        EventTopic::ListeningEvent => PushEvent::Listening(serde_json::from_value(payload)?),
    })
}
