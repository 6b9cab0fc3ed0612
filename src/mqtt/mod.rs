use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use std::io::Error;
use crate::config::ConfigBases;
use crate::linky::{device::MeterCapabilities, ChannelEvent};
use crate::models::{DeviceProtocol, DeviceStatus};
use crate::{get_config_or_panic, get_unix_ts, CONFIG};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use serde::{Serialize, Deserialize};
use serde_json;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::{Duration, Instant};

pub const BASE_TOPIC: &str = "linky2mqtt";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MqttConnectionStatus {
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Clone)]
pub struct MqttHealthStatus {
    pub status: MqttConnectionStatus,
    pub last_connected: Option<Instant>,
    pub last_message_sent: Option<Instant>,
    pub last_message_received: Option<Instant>,
    pub connection_attempts: u64,
}

/// Last known state of one logical meter
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceHealth {
    pub protocol: Option<DeviceProtocol>,
    pub status: DeviceStatus,
    pub invalid_frames: u64,
    pub capabilities: Option<MeterCapabilities>,
    pub last_update: Option<u64>,
}

impl DeviceHealth {
    fn new() -> Self {
        DeviceHealth {
            protocol: None,
            status: DeviceStatus::Unknown,
            invalid_frames: 0,
            capabilities: None,
            last_update: None,
        }
    }
}

#[derive(Clone)]
pub struct AppStatus {
    pub start_time: Instant,
    pub mqtt_health: MqttHealthStatus,
    pub devices: HashMap<String, DeviceHealth>,
}

impl MqttHealthStatus {
    pub fn new() -> Self {
        Self {
            status: MqttConnectionStatus::Disconnected,
            last_connected: None,
            last_message_sent: None,
            last_message_received: None,
            connection_attempts: 0,
        }
    }
}

impl AppStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_health: MqttHealthStatus::new(),
            devices: HashMap::new(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Keeps the per device view of the API in line with what goes out to the broker
    pub fn track(&mut self, transmission: &Transmission) {
        match transmission {
            Transmission::Channel(event) => {
                self.device(&event.device).last_update = Some(get_unix_ts());
            }
            Transmission::Capabilities { device, capabilities } => {
                self.device(device).capabilities = Some(*capabilities);
            }
            Transmission::Status { device, protocol, status } => {
                let entry = self.device(device);
                entry.protocol = Some(*protocol);
                entry.status = status.clone();
            }
            Transmission::InvalidFrames { device, count } => {
                self.device(device).invalid_frames = *count;
            }
            Transmission::Subscribe(_) | Transmission::Publish(_) => {}
        }
    }

    fn device(&mut self, name: &str) -> &mut DeviceHealth {
        self.devices.entry(name.to_string()).or_insert_with(DeviceHealth::new)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>
}

pub enum Transmission {
    /// One decoded or derived channel value
    Channel(ChannelEvent),
    Capabilities { device: String, capabilities: MeterCapabilities },
    Status { device: String, protocol: DeviceProtocol, status: DeviceStatus },
    InvalidFrames { device: String, count: u64 },
    Subscribe(SubscribeData),
    Publish(PublishData)
}

pub fn device_topic(device: &str) -> String {
    format!("{}/devs/{}", BASE_TOPIC, device)
}

pub fn channel_topic(event: &ChannelEvent) -> String {
    format!("{}/{}/{}", device_topic(&event.device), event.group, event.channel)
}

pub fn status_topic(device: &str) -> String {
    format!("{}/status", device_topic(device))
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    status: String,
    protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Maps a transmission onto what is sent to the broker, `None` for non publishing ones
pub fn to_publish(transmission: &Transmission) -> Option<PublishData> {
    match transmission {
        Transmission::Channel(event) => Some(PublishData {
            topic: channel_topic(event),
            payload: event.value.to_payload(),
            qos: 0,
            retain: false,
        }),
        Transmission::Capabilities { device, capabilities } => Some(PublishData {
            topic: format!("{}/capabilities", device_topic(device)),
            payload: serde_json::to_string(capabilities).ok()?,
            qos: 1,
            retain: true,
        }),
        Transmission::Status { device, protocol, status } => {
            let payload = StatusPayload {
                status: status.to_string(),
                protocol: protocol.to_string(),
                reason: status.reason(),
            };
            Some(PublishData {
                topic: status_topic(device),
                payload: serde_json::to_string(&payload).ok()?,
                qos: 1,
                retain: true,
            })
        }
        Transmission::InvalidFrames { device, count } => Some(PublishData {
            topic: format!("{}/invalid_frames", status_topic(device)),
            payload: count.to_string(),
            qos: 0,
            retain: true,
        }),
        Transmission::Publish(data) => Some(data.clone()),
        Transmission::Subscribe(_) => None,
    }
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding callback to topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: String, payload: String) {
        let v = match self.calls.get(&topic) {
            Some(v) => v,
            None => {
                debug!("Send for unknown topic {topic}");
                return;
            }
        };

        for call in v {
            debug!("Sending to callback: {payload}");
            if call.send(payload.clone()).await.is_err() {
                warn!("Callback of {topic} is gone");
            }
        }
    }

    pub async fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

impl MqttManager {
    pub fn new() -> Result<(Self, Sender<Transmission>), Error> {
        let (mtx,mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let config = get_config_or_panic!("mqtt", ConfigBases::Mqtt);
        let mut mqttoptions   = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incomming commands
        let reconnect_c = client.clone();
        tokio::spawn( async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = match String::from_utf8(p.payload.to_vec()) {
                            Ok(payload) => payload,
                            Err(_) => {
                                warn!("Ignoring non UTF-8 command on {topic}");
                                continue;
                            }
                        };
                        debug!("Received MQTT command {payload:?}");
                        APP_STATUS.write().await.mqtt_health.last_message_received = Some(Instant::now());

                        let callback = CALLBACKS.read().await;
                        callback.send(topic, payload).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");
                        {
                            let mut app_status = APP_STATUS.write().await;
                            app_status.mqtt_health.status = MqttConnectionStatus::Connected;
                            app_status.mqtt_health.last_connected = Some(Instant::now());
                        }

                        /* We are connected resubstribe to everything */
                        let callbacks = CALLBACKS.read().await.get_topics().await;
                        for callback in callbacks {
                            /* Move the resubscription to it's own thread */
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(callback.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {callback} failed: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        {
                            let mut app_status = APP_STATUS.write().await;
                            app_status.mqtt_health.status = MqttConnectionStatus::Error(e.to_string());
                            app_status.mqtt_health.connection_attempts += 1;
                        }
                        /* rumqttc reconnects on the next poll, do not spin on a dead broker */
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return Ok((MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
        }, mtx));
    }

    pub async fn start_thread(&mut self) {

        // Handle all the incomming channel updates
        while !self.exit_thread {
            let transmission = match self.rx.recv().await {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            APP_STATUS.write().await.track(&transmission);

            if let Transmission::Subscribe(subscribe_data) = transmission {
                let topic = format!("{}/{}", BASE_TOPIC, subscribe_data.topic);
                if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                    CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                    info!("Registered Callback {topic}");
                }
                continue;
            }

            let publish_data = match to_publish(&transmission) {
                Some(p) => p,
                None => continue,
            };

            match self.client.publish(
                publish_data.topic,
                qos_from(publish_data.qos),
                publish_data.retain,
                publish_data.payload
            ).await {
                Err(e) => { error!("Error publishing: {}", e); },
                Ok(_) => {
                    debug!("Published successfully");
                    APP_STATUS.write().await.mqtt_health.last_message_sent = Some(Instant::now());
                }
            }
        }

        info!("Thread exit, waiting");
    }
}

pub async fn get_app_status() -> AppStatus {
    APP_STATUS.read().await.clone()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>) {
    let app_status = get_app_status().await;

    let uptime_publish = PublishData {
        topic: format!("{}/mgt/uptime", BASE_TOPIC),
        payload: app_status.uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}

pub async fn publish_protocol_count(mqtt_sender: &Sender<Transmission>, protocol: &str, count: u32) {
    let count_publish = PublishData {
        topic: format!("{}/mgt/{}/count", BASE_TOPIC, protocol),
        payload: count.to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(count_publish)).await;
}
