use crate::{config::{ConfigBases, D2lListenerConfig, TicSerialConfig}, get_config_or_panic, models::{DeviceProtocol, DeviceStatus}, mqtt::{publish_protocol_count, SubscribeData, Transmission}, CONFIG};
use device::FrameOutcome;
use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::{mpsc::{Receiver, Sender}, watch}, task::JoinHandle};

pub mod tic;
pub mod d2l;
pub mod fields;
pub mod interpreter;
pub mod registers;
pub mod derived;
pub mod device;
pub mod serial;
pub mod network;

/// Custom error types for Linky acquisition and decoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkyError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Checksum mismatch on group {label}: expected {expected:?}, received {received:?}")]
    ChecksumMismatch { label: String, expected: char, received: char },
    #[error("Stream closed")]
    StreamClosed,
    #[error("Decryption failed: {0}")]
    CryptoFailure(String),
    #[error("Device {0} not configured")]
    UnknownDevice(String),
    #[error("Field {label} can not be decoded from {value:?}")]
    UnparsableField { label: String, value: String },
    #[error("Resource not available: {0}")]
    ResourceFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContactState {
    Open,
    Closed,
}

/// Typed value of one channel update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChannelValue {
    Text(String),
    Quantity { value: f64, unit: &'static str },
    Integer(u64),
    Timestamp(DateTime<FixedOffset>),
    Contact(ContactState),
    Switch(bool),
}

impl ChannelValue {
    /// Renders the value the way it is published to the broker
    pub fn to_payload(&self) -> String {
        match self {
            ChannelValue::Text(s) => s.clone(),
            ChannelValue::Quantity { value, .. } => format_number(*value),
            ChannelValue::Integer(i) => i.to_string(),
            ChannelValue::Timestamp(ts) => ts.to_rfc3339(),
            ChannelValue::Contact(ContactState::Open) => "OPEN".to_string(),
            ChannelValue::Contact(ContactState::Closed) => "CLOSED".to_string(),
            ChannelValue::Switch(true) => "ON".to_string(),
            ChannelValue::Switch(false) => "OFF".to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Quantity { value, .. } => Some(*value),
            ChannelValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{:.6}", value).trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// One update for one channel of one logical device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEvent {
    pub device: String,
    pub group: String,
    pub channel: String,
    pub value: ChannelValue,
}

/// Asks every acquisition loop of a manager to tear down, usable after the manager moved into its task
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// Starts one acquisition loop per configured serial link and D2L listener
pub struct LinkyManager {
    sender: Sender<Transmission>,
    threads: Vec<JoinHandle<()>>,
    stop: StopHandle,
}

impl LinkyManager {
    pub fn new(sender: Sender<Transmission>) -> Self {
        let (stop, _) = watch::channel(false);
        return LinkyManager {
            sender,
            threads: Vec::new(),
            stop: StopHandle(Arc::new(stop)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn start_thread(&mut self) {
        info!("Starting Linky thread");
        let serial_links: Vec<TicSerialConfig> = get_config_or_panic!("serial", ConfigBases::Serial);
        let d2l_listeners: Vec<D2lListenerConfig> = get_config_or_panic!("d2l", ConfigBases::D2l);

        if serial_links.is_empty() && d2l_listeners.is_empty() {
            warn!("No Linky serial link and no D2L listener configured, nothing to do");
        }

        let tic_devices: usize = serial_links.iter().map(|l| l.devices.len()).sum();
        let d2l_devices: usize = d2l_listeners.iter().map(|l| l.devices.len()).sum();
        publish_protocol_count(&self.sender, "tic", tic_devices as u32).await;
        publish_protocol_count(&self.sender, "d2l", d2l_devices as u32).await;

        for link in serial_links {
            let sender = self.sender.clone();
            let stop = self.stop.subscribe();
            info!("Starting TIC serial link {} on {}", link.name, link.port);
            self.threads.push(tokio::spawn(async move {
                serial::TicLink::new(link, sender).run(stop).await;
            }));
        }

        for listener in d2l_listeners {
            let sender = self.sender.clone();
            let stop = self.stop.subscribe();
            info!("Starting D2L listener {} on port {}", listener.name, listener.port);
            self.threads.push(tokio::spawn(async move {
                network::D2lListener::new(listener, sender).run(stop).await;
            }));
        }

        /* A loop that ended stays down, bringing it back is up to the operator */
        for thread in self.threads.iter_mut() {
            let _ = thread.await;
        }

        debug!("All Linky loops ended");
        std::future::pending::<()>().await;
    }

}

/// Subscribes the power factor command topic of every device and merges them into one receiver
pub async fn subscribe_power_factor(sender: &Sender<Transmission>, devices: &[String]) -> Receiver<(String, String)> {
    let (tx, rx) = tokio::sync::mpsc::channel(10);

    for name in devices {
        let (device_tx, mut device_rx) = tokio::sync::mpsc::channel::<String>(10);
        let register = Transmission::Subscribe(SubscribeData {
            topic: format!("{}/power_factor/set", name),
            sender: device_tx,
        });
        let _ = sender.send(register).await;

        let tx = tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            while let Some(command) = device_rx.recv().await {
                if tx.send((name.clone(), command)).await.is_err() {
                    break;
                }
            }
        });
    }

    rx
}

pub(crate) async fn publish_status(sender: &Sender<Transmission>, device: &str, protocol: DeviceProtocol, status: DeviceStatus) {
    let _ = sender.send(Transmission::Status { device: device.to_string(), protocol, status }).await;
}

/// Capabilities go out before the channels of the frame they were detected on
pub(crate) async fn publish_outcome(sender: &Sender<Transmission>, device: &str, outcome: FrameOutcome) {
    if let Some(capabilities) = outcome.capabilities {
        let _ = sender.send(Transmission::Capabilities { device: device.to_string(), capabilities }).await;
    }
    for event in outcome.events {
        if sender.send(Transmission::Channel(event)).await.is_err() {
            debug!("MQTT channel closed, dropping updates of {device}");
            return;
        }
    }
}
