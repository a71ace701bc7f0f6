//! MQTT state publisher.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::StatePublisher;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    pub enabled: bool,
    /// `host:port`, optionally prefixed with `mqtt://` or `mqtts://`.
    pub broker: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub state_topic: String,
    pub client_id: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "127.0.0.1:1883".to_string(),
            username: None,
            password: None,
            state_topic: "home-assistant/presence/sensor1".to_string(),
            client_id: "presenced".to_string(),
        }
    }
}

impl MqttSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        parse_mqtt_endpoint(&self.broker)?;
        if self.state_topic.trim().is_empty() {
            return Err(anyhow!("notify.mqtt.state_topic must not be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(anyhow!("notify.mqtt.client_id must not be empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let default_port = if use_tls { 8883 } else { 1883 };
    let (host, port) = split_host_port(remainder, default_port)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in '{}'", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().context("invalid MQTT port")?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().context("invalid MQTT port")?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

/// Publishes state messages with QoS 1 and the retain flag set, so late subscribers see the
/// last state. The connection is driven by a background thread that keeps reconnecting.
pub struct MqttPublisher {
    client: Client,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        log::info!(
            "mqtt publisher for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(connection, stopping.clone())?;
        Ok(Self {
            client,
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        })
    }
}

fn spawn_connection(mut connection: Connection, stopping: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(err) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", err);
                        std::thread::sleep(RECONNECT_BACKOFF);
                    }
                }
            }
        })?;
    Ok(handle)
}

impl StatePublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload.to_vec())
            .with_context(|| format!("queue MQTT publish to {}", topic))?;
        Ok(())
    }

    fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.try_disconnect() {
            log::warn!("MQTT disconnect failed: {}", err);
        }
        let handle = match self.connection_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("mqtt connection thread panicked");
            }
        }
    }
}
