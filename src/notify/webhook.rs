//! Webhook notifications.
//!
//! Each transition is POSTed as `{"state": "present"|"absent", "timestamp": <unix secs>}`. The
//! request runs on a worker thread so a slow endpoint never stalls the detect loop.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

use super::StateWebhook;
use crate::presence::Occupancy;

#[derive(Debug, Serialize)]
struct WebhookPayload {
    state: Occupancy,
    timestamp: u64,
}

pub struct WebhookSender {
    queue: Mutex<Option<Sender<WebhookPayload>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookSender {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("invalid webhook url '{}'", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("webhook url must be http(s), got '{}'", url));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let (tx, rx) = mpsc::channel::<WebhookPayload>();
        let target = parsed.to_string();
        let worker = std::thread::Builder::new()
            .name("webhook".to_string())
            .spawn(move || {
                for payload in rx {
                    if let Err(err) = post(&agent, &target, &payload) {
                        log::warn!("webhook {} failed: {:#}", target, err);
                    }
                }
            })?;
        Ok(Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn post(agent: &ureq::Agent, url: &str, payload: &WebhookPayload) -> Result<()> {
    let body = serde_json::to_string(payload)?;
    agent
        .post(url)
        .set("Content-Type", "application/json")
        .send_string(&body)?;
    log::debug!("webhook delivered state {}", payload.state.as_str());
    Ok(())
}

impl StateWebhook for WebhookSender {
    fn send(&self, state: Occupancy) -> Result<()> {
        let payload = WebhookPayload {
            state,
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
        };
        let queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("webhook queue lock poisoned"))?;
        let tx = queue
            .as_ref()
            .ok_or_else(|| anyhow!("webhook sender closed"))?;
        tx.send(payload)
            .map_err(|_| anyhow!("webhook worker stopped"))?;
        Ok(())
    }

    /// Delivers what is already queued, then stops the worker.
    fn close(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("webhook worker panicked");
            }
        }
    }
}
