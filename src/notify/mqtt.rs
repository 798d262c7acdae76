//! MQTT alert publisher.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{AlertNotice, Notifier};
use crate::CameraId;

pub const DEFAULT_TOPIC_PREFIX: &str = "crimewatch";
pub const DEFAULT_CLIENT_ID: &str = "crimewatchd";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub struct MqttSettings {
    /// `host:port`, optionally prefixed with `mqtt://` or `mqtts://`.
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

pub struct MqttNotifier {
    client: Client,
    topic_prefix: String,
    shutdown: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_event_loop(connection, shutdown.clone());
        log::info!(
            "MQTT notifier targeting {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.trim_end_matches('/').to_string(),
            shutdown,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic_for(&self, camera_id: CameraId) -> String {
        alert_topic(&self.topic_prefix, camera_id)
    }

    /// Ask the broker connection to close and wait up to five seconds for the event
    /// loop to drain. Publishes queued ahead of the disconnect are sent first.
    pub fn disconnect(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.try_disconnect() {
            log::warn!("MQTT disconnect not queued: {}", err);
        }
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt handle lock poisoned"))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            log::warn!("MQTT event loop still busy after disconnect; undelivered alerts may be lost");
        }
        Ok(())
    }
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    /// Never blocks: a full request queue (broker down) rejects the notice.
    fn notify(&self, notice: &AlertNotice) -> Result<()> {
        let payload = serde_json::to_vec(notice).context("serialize alert notice")?;
        self.client
            .try_publish(self.topic_for(notice.camera_id), QoS::AtLeastOnce, false, payload)
            .context("MQTT request queue full or closed")?;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.disconnect()
    }
}

fn spawn_event_loop(mut connection: Connection, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("MQTT connection error: {}", e);
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    })
}

pub(crate) fn alert_topic(prefix: &str, camera_id: CameraId) -> String {
    format!("{}/cameras/{}/alert", prefix, camera_id)
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

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing_handles_schemes() {
        let plain = parse_mqtt_endpoint("127.0.0.1:1883").unwrap();
        assert_eq!(plain.host, "127.0.0.1");
        assert_eq!(plain.port, 1883);
        assert!(!plain.use_tls);

        let tls = parse_mqtt_endpoint("mqtts://broker.local:8883").unwrap();
        assert!(tls.use_tls);
        assert_eq!(tls.host, "broker.local");

        let v6 = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(v6.host, "::1");
    }

    #[test]
    fn endpoint_parsing_rejects_bad_input() {
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
    }

    #[test]
    fn alert_topic_layout() {
        assert_eq!(alert_topic("crimewatch", 4), "crimewatch/cameras/4/alert");
    }

    #[test]
    fn notify_never_blocks_on_unreachable_broker() {
        let notifier = Arc::new(MqttNotifier::connect(&MqttSettings::new("127.0.0.1:1")).unwrap());
        let burst = REQUEST_CAPACITY * 3;

        let (tx, rx) = std::sync::mpsc::channel();
        let sender = notifier.clone();
        std::thread::spawn(move || {
            let notice = AlertNotice {
                camera_id: 1,
                label: "Robbery".to_string(),
                confidence: 0.93,
                snapshot_ref: None,
                record_id: Some(1),
                timestamp: 1_700_000_000,
            };
            let results: Vec<bool> = (0..burst).map(|_| sender.notify(&notice).is_ok()).collect();
            let _ = tx.send(results);
        });

        let results = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("notify calls returned");
        assert_eq!(results.len(), burst);
        assert!(results.iter().any(|queued| !queued));

        notifier.disconnect().unwrap();
    }
}
