//! Occupancy notification fan-out.
//!
//! Every transition goes to the pub/sub publisher and the webhook. Heartbeats only re-publish
//! the current state on the pub/sub channel. Delivery is fire-and-forget: failures are logged
//! and never reach the detect loop.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::presence::Occupancy;

pub mod mqtt;
pub mod webhook;

pub use mqtt::{MqttPublisher, MqttSettings};
pub use webhook::WebhookSender;

/// Pub/sub channel for the numeric occupancy state.
pub trait StatePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Flush and disconnect. Called once on shutdown.
    fn close(&self) {}
}

/// HTTP callback for transitions.
pub trait StateWebhook: Send + Sync {
    fn send(&self, state: Occupancy) -> Result<()>;

    fn close(&self) {}
}

/// Fans occupancy updates out to the configured channels.
pub struct Notifier {
    publisher: Option<Box<dyn StatePublisher>>,
    state_topic: String,
    webhook: Option<Box<dyn StateWebhook>>,
    publish_enabled: AtomicBool,
}

impl Notifier {
    /// Notifier with no channels; every call is a no-op.
    pub fn disabled() -> Self {
        Self::new(None, String::new(), None)
    }

    pub fn new(
        publisher: Option<Box<dyn StatePublisher>>,
        state_topic: String,
        webhook: Option<Box<dyn StateWebhook>>,
    ) -> Self {
        Self {
            publisher,
            state_topic,
            webhook,
            publish_enabled: AtomicBool::new(true),
        }
    }

    /// Runtime switch for the pub/sub channel (the `send_mqtt` tunable).
    pub fn set_publish_enabled(&self, enabled: bool) {
        self.publish_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn publish_enabled(&self) -> bool {
        self.publish_enabled.load(Ordering::SeqCst)
    }

    /// Announce a state change on every channel.
    pub fn transition(&self, state: Occupancy) {
        self.publish_state(state);
        if let Some(webhook) = &self.webhook {
            if let Err(err) = webhook.send(state) {
                log::warn!("webhook notification failed: {:#}", err);
            }
        }
    }

    /// Re-publish the current state. The webhook is not called.
    pub fn heartbeat(&self, state: Occupancy) {
        self.publish_state(state);
    }

    fn publish_state(&self, state: Occupancy) {
        if !self.publish_enabled() {
            return;
        }
        let Some(publisher) = &self.publisher else {
            return;
        };
        let payload = state.as_flag().to_string();
        if let Err(err) = publisher.publish(&self.state_topic, payload.as_bytes()) {
            log::warn!(
                "publish to '{}' failed: {:#}",
                self.state_topic,
                err
            );
        }
    }

    pub fn close(&self) {
        if let Some(publisher) = &self.publisher {
            publisher.close();
        }
        if let Some(webhook) = &self.webhook {
            webhook.close();
        }
    }
}
