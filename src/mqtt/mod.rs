//! MQTT bus wrapper for Home Assistant.
//!
//! Wraps a `rumqttc` client with the agent's session policy: persistent
//! session, retained last-will on the availability topic, reconnect with
//! backoff, and a strict on-connect order (availability first, then entity
//! discovery, then the command subscriptions). Topic strings for the known
//! sensors and commands are pre-computed once; unknown names fall back to
//! on-demand formatting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::core::error::BusError;

const DISCOVERY_PREFIX: &str = "homeassistant";
const NOTIFICATIONS_PREFIX: &str = "hass.agent/notifications";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sensors with pre-computed state topics
const SENSOR_NAMES: [&str; 3] = ["runninggames", "lastactive", "sleep_state"];

/// Command vocabulary with discovery icons
const COMMANDS: [(&str, &str); 7] = [
    ("SteamLaunch", "mdi:steam"),
    ("Screensaver", "mdi:monitor"),
    ("Wake", "mdi:monitor-eye"),
    ("Shutdown", "mdi:power"),
    ("sleep", "mdi:power-sleep"),
    ("discord_join", "mdi:discord"),
    ("discord_leave_channel", "mdi:phone-hangup"),
];

/// Retained publishes (sleep state) wait at most this long
const RETAINED_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Quiesce delay before dropping the connection on shutdown
const DISCONNECT_QUIESCE: Duration = Duration::from_millis(500);

/// Command received from the bus
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub payload: String,
}

/// Pre-computed topic strings.
struct Topics {
    device_name: String,
    availability: Arc<str>,
    notifications: Arc<str>,
    sensor_state: HashMap<&'static str, Arc<str>>,
    command_action: HashMap<&'static str, Arc<str>>,
    /// `homeassistant/button/<D>/` for incoming topic matching
    button_prefix: String,
}

impl Topics {
    fn new(device_name: &str) -> Self {
        let mut sensor_state = HashMap::new();
        for name in SENSOR_NAMES {
            sensor_state.insert(
                name,
                Arc::from(format!(
                    "{DISCOVERY_PREFIX}/sensor/{device_name}/{name}/state"
                )),
            );
        }

        let mut command_action = HashMap::new();
        for (name, _) in COMMANDS {
            command_action.insert(
                name,
                Arc::from(format!(
                    "{DISCOVERY_PREFIX}/button/{device_name}/{name}/action"
                )),
            );
        }

        Self {
            device_name: device_name.to_string(),
            availability: Arc::from(format!(
                "{DISCOVERY_PREFIX}/sensor/{device_name}/availability"
            )),
            notifications: Arc::from(format!("{NOTIFICATIONS_PREFIX}/{device_name}")),
            sensor_state,
            command_action,
            button_prefix: format!("{DISCOVERY_PREFIX}/button/{device_name}/"),
        }
    }

    fn sensor_state(&self, name: &str) -> String {
        match self.sensor_state.get(name) {
            Some(cached) => cached.to_string(),
            None => format!(
                "{DISCOVERY_PREFIX}/sensor/{}/{name}/state",
                self.device_name
            ),
        }
    }

    fn command_action(&self, name: &str) -> String {
        match self.command_action.get(name) {
            Some(cached) => cached.to_string(),
            None => format!(
                "{DISCOVERY_PREFIX}/button/{}/{name}/action",
                self.device_name
            ),
        }
    }

    fn config_topic(&self, component: &str, entity: &str) -> String {
        format!(
            "{DISCOVERY_PREFIX}/{component}/{}/{entity}/config",
            self.device_name
        )
    }

    /// Map an incoming topic to a command name.
    fn command_from_topic(&self, topic: &str) -> Option<String> {
        if let Some(rest) = topic.strip_prefix(&self.button_prefix) {
            return rest.strip_suffix("/action").map(|s| s.to_string());
        }
        if topic == self.notifications.as_ref() {
            return Some("notification".to_string());
        }
        None
    }
}

/// Home Assistant MQTT discovery payload
#[derive(Serialize)]
struct DiscoveryPayload {
    name: String,
    unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_topic: Option<String>,
    device: Arc<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<String>,
}

#[derive(Serialize)]
struct DeviceInfo {
    identifiers: Vec<String>,
    name: String,
    model: String,
    manufacturer: String,
    sw_version: String,
}

/// Cheaply clonable handle to the bus.
///
/// The supervisor owns the canonical copy behind its mutex; workers copy it
/// out under the lock and publish outside.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topics: Arc<Topics>,
    device: Arc<DeviceInfo>,
    device_id: String,
}

/// Connect to the broker described by `config`.
///
/// Returns the handle plus the stream of incoming commands. The connection
/// is maintained by a background task until [`MqttHandle::disconnect`] runs
/// (or the runtime shuts down); connect failures are non-fatal and retried
/// with backoff.
pub fn connect(
    config: &AgentConfig,
) -> Result<(MqttHandle, mpsc::Receiver<Command>), BusError> {
    let (host, port) = parse_broker_url(config.broker())?;

    let topics = Arc::new(Topics::new(&config.device_name));
    let device_id = config.device_id();

    let mut opts = MqttOptions::new(config.client_id(), host, port);
    if !config.mqtt.user.is_empty() {
        opts.set_credentials(&config.mqtt.user, &config.mqtt.pass);
    }
    opts.set_keep_alive(KEEP_ALIVE);
    // Persistent session: subscriptions survive reconnects.
    opts.set_clean_session(false);
    opts.set_last_will(LastWill::new(
        topics.availability.as_ref(),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(opts, 100);

    let device = Arc::new(DeviceInfo {
        identifiers: vec![device_id.clone()],
        name: config.device_name.clone(),
        model: format!("PC Agent v{VERSION}"),
        manufacturer: "pc-agent".to_string(),
        sw_version: VERSION.to_string(),
    });

    let handle = MqttHandle {
        client,
        connected: Arc::new(AtomicBool::new(false)),
        topics,
        device,
        device_id,
    };

    let (command_tx, command_rx) = mpsc::channel(50);
    tokio::spawn(run_event_loop(handle.clone(), eventloop, command_tx));

    Ok((handle, command_rx))
}

/// Drive the connection: dispatch incoming publishes, re-announce on every
/// connect, back off on errors. Exits once the client's own disconnect has
/// gone out, so the final offline publish is flushed first.
async fn run_event_loop(
    handle: MqttHandle,
    mut eventloop: rumqttc::EventLoop,
    command_tx: mpsc::Sender<Command>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                handle.connected.store(true, Ordering::SeqCst);
                backoff = BACKOFF_INITIAL;
                info!("MQTT connected - announcing device");
                // Availability must precede discovery and subscriptions so
                // the hub never sees entities of an offline device.
                handle.publish_availability(true).await;
                handle.publish_discovery().await;
                handle.subscribe_commands().await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "MQTT message: {} = {}",
                    publish.topic,
                    String::from_utf8_lossy(&publish.payload)
                );
                if let Some(name) = handle.topics.command_from_topic(&publish.topic) {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    if command_tx.send(Command { name, payload }).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                handle.connected.store(false, Ordering::SeqCst);
                warn!("MQTT broker requested disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                handle.connected.store(false, Ordering::SeqCst);
                debug!("MQTT event loop stopping after disconnect");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                handle.connected.store(false, Ordering::SeqCst);
                warn!("MQTT error: {e:?} (retrying in {backoff:?})");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

impl MqttHandle {
    /// Connection state as observed by the event loop.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fire-and-forget telemetry publish (non-retained).
    pub async fn publish_sensor(&self, name: &str, value: &str) {
        let topic = self.topics.sensor_state(name);
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, value)
            .await
        {
            warn!("Failed to publish {name}: {e}");
        }
    }

    /// Retained state publish, bounded to 5 s so a slow broker never stalls
    /// the caller (the suspend path runs this synchronously).
    pub async fn publish_sensor_retained(&self, name: &str, value: &str) {
        let topic = self.topics.sensor_state(name);
        match tokio::time::timeout(
            RETAINED_PUBLISH_TIMEOUT,
            self.client.publish(&topic, QoS::AtLeastOnce, true, value),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to publish {name}: {e}"),
            Err(_) => warn!("Publish {name} timed out"),
        }
    }

    /// Retained availability publish.
    pub async fn publish_availability(&self, online: bool) {
        let payload = if online {
            Bytes::from_static(b"online")
        } else {
            Bytes::from_static(b"offline")
        };
        if let Err(e) = self
            .client
            .publish(
                self.topics.availability.as_ref(),
                QoS::AtLeastOnce,
                true,
                payload,
            )
            .await
        {
            warn!("Failed to publish availability: {e}");
        }
    }

    /// Graceful disconnect with a short quiesce for in-flight acks.
    pub async fn disconnect(&self) {
        self.publish_availability(false).await;
        tokio::time::sleep(DISCONNECT_QUIESCE).await;
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Register every entity with the hub.
    async fn publish_discovery(&self) {
        self.register_sensor("runninggames", "Running Game", "mdi:gamepad-variant", None, true)
            .await;
        self.register_sensor(
            "lastactive",
            "Last Active",
            "mdi:clock-outline",
            Some("timestamp"),
            true,
        )
        .await;
        // No availability topic: the hub keeps showing the last sleep state
        // while this machine is asleep.
        self.register_sensor("sleep_state", "Sleep State", "mdi:power-sleep", None, false)
            .await;

        for (name, icon) in COMMANDS {
            self.register_button(name, icon).await;
        }

        self.register_notify_service().await;

        info!("Registered discovery for {} entities", 3 + COMMANDS.len() + 1);
    }

    async fn register_sensor(
        &self,
        name: &str,
        display_name: &str,
        icon: &str,
        device_class: Option<&str>,
        with_availability: bool,
    ) {
        let payload = DiscoveryPayload {
            name: display_name.to_string(),
            unique_id: format!("{}_{name}", self.device_id),
            state_topic: Some(self.topics.sensor_state(name)),
            command_topic: None,
            availability_topic: with_availability
                .then(|| self.topics.availability.to_string()),
            device: Arc::clone(&self.device),
            icon: Some(icon.to_string()),
            device_class: device_class.map(|s| s.to_string()),
        };
        self.publish_config("sensor", name, &payload).await;
    }

    async fn register_button(&self, name: &str, icon: &str) {
        let payload = DiscoveryPayload {
            name: name.to_string(),
            unique_id: format!("{}_{name}", self.device_id),
            state_topic: None,
            command_topic: Some(self.topics.command_action(name)),
            availability_topic: Some(self.topics.availability.to_string()),
            device: Arc::clone(&self.device),
            icon: Some(icon.to_string()),
            device_class: None,
        };
        self.publish_config("button", name, &payload).await;
    }

    /// The notify platform delivers its messages on the notifications topic
    /// rather than a button action topic.
    async fn register_notify_service(&self) {
        let payload = serde_json::json!({
            "name": "Notification",
            "unique_id": format!("{}_notify", self.device_id),
            "command_topic": self.topics.notifications.as_ref(),
            "availability_topic": self.topics.availability.as_ref(),
            "device": &*self.device,
            "icon": "mdi:message-badge",
            "qos": 1
        });
        let topic = self.topics.config_topic("notify", &self.topics.device_name);
        match serde_json::to_string(&payload) {
            Ok(json) => {
                if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, true, json).await {
                    warn!("Failed to publish notify discovery: {e}");
                }
            }
            Err(e) => error!("Failed to serialize notify discovery payload: {e}"),
        }
    }

    async fn publish_config(&self, component: &str, entity: &str, payload: &DiscoveryPayload) {
        let topic = self.topics.config_topic(component, entity);
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize discovery payload: {e}");
                return;
            }
        };
        if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, true, json).await {
            warn!("Failed to publish discovery for {entity}: {e}");
        }
    }

    /// Subscribe to every command action topic plus notifications, QoS 1.
    async fn subscribe_commands(&self) {
        let mut count = 0usize;
        for (name, _) in COMMANDS {
            let topic = self.topics.command_action(name);
            match self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                Ok(()) => count += 1,
                Err(e) => warn!("Failed to subscribe to {topic}: {e}"),
            }
        }
        let topic = self.topics.notifications.to_string();
        match self.client.subscribe(&topic, QoS::AtLeastOnce).await {
            Ok(()) => count += 1,
            Err(e) => warn!("Failed to subscribe to {topic}: {e}"),
        }
        info!("Subscribed to {count} command topics");
    }
}

/// Split a broker URL into host and port. The scheme was validated at
/// config load; the connection itself is plain TCP.
fn parse_broker_url(url: &str) -> Result<(String, u16), BusError> {
    let without_scheme = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("ssl://"))
        .or_else(|| url.strip_prefix("ws://"))
        .or_else(|| url.strip_prefix("wss://"))
        .unwrap_or(url);

    let mut parts = without_scheme.split(':');
    let host = parts.next().unwrap_or_default().to_string();
    if host.is_empty() {
        return Err(BusError::InvalidBrokerUrl {
            url: url.to_string(),
        });
    }
    let port = match parts.next() {
        Some(p) => p.parse().map_err(|_| BusError::InvalidBrokerUrl {
            url: url.to_string(),
        })?,
        None => 1883,
    };
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Handle whose event loop is never polled; no broker contact is made.
    fn test_handle(device_name: &str) -> MqttHandle {
        let opts = MqttOptions::new("test-client", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 10);
        let device_id = device_name.replace('-', "_");
        MqttHandle {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            topics: Arc::new(Topics::new(device_name)),
            device: Arc::new(DeviceInfo {
                identifiers: vec![device_id.clone()],
                name: device_name.to_string(),
                model: format!("PC Agent v{VERSION}"),
                manufacturer: "pc-agent".to_string(),
                sw_version: VERSION.to_string(),
            }),
            device_id,
        }
    }

    #[test]
    fn test_precomputed_sensor_topics() {
        let topics = Topics::new("office-pc");
        for name in SENSOR_NAMES {
            assert_eq!(
                topics.sensor_state(name),
                format!("homeassistant/sensor/office-pc/{name}/state")
            );
            assert!(topics.sensor_state.contains_key(name));
        }
    }

    #[test]
    fn test_unknown_sensor_topic_falls_back_to_format() {
        let topics = Topics::new("office-pc");
        assert!(!topics.sensor_state.contains_key("display"));
        assert_eq!(
            topics.sensor_state("display"),
            "homeassistant/sensor/office-pc/display/state"
        );
    }

    #[test]
    fn test_precomputed_command_topics() {
        let topics = Topics::new("office-pc");
        assert_eq!(
            topics.command_action("SteamLaunch"),
            "homeassistant/button/office-pc/SteamLaunch/action"
        );
        assert_eq!(
            topics.command_action("unknown"),
            "homeassistant/button/office-pc/unknown/action"
        );
    }

    #[test]
    fn test_availability_and_notification_topics() {
        let topics = Topics::new("office-pc");
        assert_eq!(
            topics.availability.as_ref(),
            "homeassistant/sensor/office-pc/availability"
        );
        assert_eq!(
            topics.notifications.as_ref(),
            "hass.agent/notifications/office-pc"
        );
    }

    #[test]
    fn test_command_from_topic() {
        let topics = Topics::new("office-pc");
        assert_eq!(
            topics.command_from_topic("homeassistant/button/office-pc/SteamLaunch/action"),
            Some("SteamLaunch".to_string())
        );
        assert_eq!(
            topics.command_from_topic("hass.agent/notifications/office-pc"),
            Some("notification".to_string())
        );
        assert_eq!(
            topics.command_from_topic("homeassistant/sensor/office-pc/runninggames/state"),
            None
        );
        assert_eq!(
            topics.command_from_topic("homeassistant/button/other-pc/Wake/action"),
            None
        );
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://homeassistant.local:1883").unwrap(),
            ("homeassistant.local".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("ssl://broker:8883").unwrap(),
            ("broker".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("tcp://broker").unwrap(),
            ("broker".to_string(), 1883)
        );
        assert!(parse_broker_url("tcp://:1883").is_err());
        assert!(parse_broker_url("tcp://broker:notaport").is_err());
    }

    #[test]
    fn test_sensor_discovery_payload_shape() {
        let handle = test_handle("office-pc");
        let payload = DiscoveryPayload {
            name: "Last Active".to_string(),
            unique_id: format!("{}_lastactive", handle.device_id),
            state_topic: Some(handle.topics.sensor_state("lastactive")),
            command_topic: None,
            availability_topic: Some(handle.topics.availability.to_string()),
            device: Arc::clone(&handle.device),
            icon: Some("mdi:clock-outline".to_string()),
            device_class: Some("timestamp".to_string()),
        };

        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["unique_id"], "office_pc_lastactive");
        assert_eq!(
            json["state_topic"],
            "homeassistant/sensor/office-pc/lastactive/state"
        );
        assert_eq!(
            json["availability_topic"],
            "homeassistant/sensor/office-pc/availability"
        );
        assert_eq!(json["device_class"], "timestamp");
        assert!(json.get("command_topic").is_none());
        assert_eq!(json["device"]["identifiers"], serde_json::json!(["office_pc"]));
        assert_eq!(json["device"]["name"], "office-pc");
    }

    #[test]
    fn test_button_discovery_payload_shape() {
        let handle = test_handle("office-pc");
        let payload = DiscoveryPayload {
            name: "Wake".to_string(),
            unique_id: format!("{}_Wake", handle.device_id),
            state_topic: None,
            command_topic: Some(handle.topics.command_action("Wake")),
            availability_topic: Some(handle.topics.availability.to_string()),
            device: Arc::clone(&handle.device),
            icon: Some("mdi:monitor-eye".to_string()),
            device_class: None,
        };

        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["unique_id"], "office_pc_Wake");
        assert_eq!(
            json["command_topic"],
            "homeassistant/button/office-pc/Wake/action"
        );
        assert!(json.get("state_topic").is_none());
        assert!(json.get("device_class").is_none());
    }

    #[test]
    fn test_sleep_state_discovery_has_no_availability() {
        let handle = test_handle("office-pc");
        let payload = DiscoveryPayload {
            name: "Sleep State".to_string(),
            unique_id: format!("{}_sleep_state", handle.device_id),
            state_topic: Some(handle.topics.sensor_state("sleep_state")),
            command_topic: None,
            availability_topic: None,
            device: Arc::clone(&handle.device),
            icon: Some("mdi:power-sleep".to_string()),
            device_class: None,
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("availability_topic"));
        assert!(json.contains("homeassistant/sensor/office-pc/sleep_state/state"));
    }

    #[test]
    fn test_config_topic_format() {
        let topics = Topics::new("office-pc");
        assert_eq!(
            topics.config_topic("sensor", "runninggames"),
            "homeassistant/sensor/office-pc/runninggames/config"
        );
        assert_eq!(
            topics.config_topic("button", "sleep"),
            "homeassistant/button/office-pc/sleep/config"
        );
    }

    #[test]
    fn test_handle_starts_disconnected() {
        let handle = test_handle("office-pc");
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_command_vocabulary_is_complete() {
        let names: Vec<&str> = COMMANDS.iter().map(|(n, _)| *n).collect();
        for expected in [
            "SteamLaunch",
            "Screensaver",
            "Wake",
            "Shutdown",
            "sleep",
            "discord_join",
            "discord_leave_channel",
        ] {
            assert!(names.contains(&expected), "missing command {expected}");
        }
    }
}
