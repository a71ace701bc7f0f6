//! presenced - camera presence daemon
//!
//! This daemon:
//! 1. Pulls frames from the configured camera (MJPEG over HTTP, or a synthetic room)
//! 2. Runs background-subtraction motion detection with an optional exclusion mask
//! 3. Confirms motion with a remote person classifier when one is configured
//! 4. Publishes occupancy transitions and heartbeats over MQTT, plus an optional webhook
//! 5. Serves status, runtime settings and an annotated MJPEG feed over HTTP

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use presence_kernel::{
    api::ApiServer,
    config::PresencedConfig,
    detect::{NoClassifier, PersonClassifier, RemoteClassifier},
    ingest::{open_source, CameraProperties},
    notify::{MqttPublisher, Notifier, StatePublisher, StateWebhook, WebhookSender},
    pipeline::{self, PipelineShared, PresencePipeline},
    snapshot::SnapshotWriter,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera presence detection daemon")]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = PresencedConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let camera = CameraProperties::new();
    let source = open_source(&config.source, camera.clone())?;
    log::info!("camera source: {}", config.source.url);

    let classifier: Box<dyn PersonClassifier> = match &config.classifier.api_url {
        Some(url) => {
            log::info!("person classifier: {}", url);
            Box::new(RemoteClassifier::http(url, config.classifier.timeout)?)
        }
        None => {
            log::info!("person classifier disabled; motion alone decides presence");
            Box::new(NoClassifier)
        }
    };
    let exclusion = config.classifier.exclusion.build()?;
    log::info!("exclusion mask: {}", exclusion.kind());

    let publisher: Option<Box<dyn StatePublisher>> = if config.notify.mqtt.enabled {
        Some(Box::new(MqttPublisher::connect(&config.notify.mqtt)?))
    } else {
        None
    };
    let webhook: Option<Box<dyn StateWebhook>> = match &config.notify.webhook_url {
        Some(url) => Some(Box::new(WebhookSender::new(
            url,
            Duration::from_secs(config.notify.webhook_timeout_secs),
        )?)),
        None => None,
    };
    let notifier = Notifier::new(publisher, config.notify.mqtt.state_topic.clone(), webhook);

    let shared = PipelineShared::new(config.shared_tunables(), camera, notifier);
    let mut presence = PresencePipeline::new(shared.clone(), classifier, exclusion)
        .with_relocate_every(config.classifier.relocate_every_frames);
    if config.snapshots.first_frame_write {
        log::info!(
            "first-frame snapshots go to {}",
            config.snapshots.path.display()
        );
        presence = presence.with_snapshots(SnapshotWriter::new(config.snapshots.path.clone()));
    }

    let handle = pipeline::spawn(
        presence,
        source,
        Duration::from_secs(config.notify.heartbeat_secs),
    )?;
    let api_handle = match ApiServer::new(config.api_addr.clone(), shared).spawn() {
        Ok(api_handle) => api_handle,
        Err(err) => {
            handle.shutdown();
            return Err(err);
        }
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("presenced running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    let api_result = api_handle.stop();
    handle.shutdown();
    api_result
}
