use super::{
    d2l::{decode_packet, D2lAssembler, D2lHeader, D2lMessage},
    device::{DeviceIdentity, DeviceRouter, FrameOutcome, LinkyDevice},
    publish_outcome, publish_status, subscribe_power_factor, LinkyError,
};
use crate::{config::D2lListenerConfig, models::{DeviceProtocol, DeviceStatus}, mqtt::Transmission};
use log::{debug, error, info, warn};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{Receiver, Sender},
        watch,
    },
    task::JoinHandle,
};

/* Gives the MQTT connection a head start before the dongles flood it */
const START_DELAY: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 1024;

type PacketResult = (SocketAddr, Result<Vec<u8>, LinkyError>);

/// TCP endpoint the D2L dongles push their encrypted packets to
pub struct D2lListener {
    config: D2lListenerConfig,
    sender: Sender<Transmission>,
    router: DeviceRouter,
    /// Devices whose key material could not be loaded, with the reason
    rejected: Vec<(String, String)>,
}

impl D2lListener {
    pub fn new(config: D2lListenerConfig, sender: Sender<Transmission>) -> Self {
        let mut devices = Vec::new();
        let mut rejected = Vec::new();

        for device in &config.devices {
            match LinkyDevice::d2l(device) {
                Ok(d) => devices.push(d),
                Err(e) => {
                    error!("D2L device {} disabled: {e}", device.name);
                    rejected.push((device.name.clone(), e.to_string()));
                }
            }
        }

        D2lListener {
            config,
            sender,
            router: DeviceRouter::new(devices),
            rejected,
        }
    }

    async fn set_status(&self, status: DeviceStatus) {
        for name in self.router.names() {
            publish_status(&self.sender, &name, DeviceProtocol::D2l, status.clone()).await;
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        for (name, reason) in &self.rejected {
            publish_status(&self.sender, name, DeviceProtocol::D2l, DeviceStatus::Offline(reason.clone())).await;
        }

        let mut commands = subscribe_power_factor(&self.sender, &self.router.names()).await;

        tokio::select! {
            _ = stop.changed() => {
                self.set_status(DeviceStatus::Offline("stopped".to_string())).await;
                return;
            },
            _ = tokio::time::sleep(START_DELAY) => {},
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.config.port)).await {
            Ok(l) => l,
            Err(e) => {
                error!("D2L listener {} can not bind port {}: {e}", self.config.name, self.config.port);
                self.set_status(DeviceStatus::Offline(format!("port {}: {e}", self.config.port))).await;
                return;
            }
        };

        info!("D2L listener {} waiting for dongles on port {}", self.config.name, self.config.port);
        self.serve(listener, &mut stop, &mut commands).await;
        self.set_status(DeviceStatus::Offline("stopped".to_string())).await;
    }

    /// Accepts dongle connections until stopped, open connections are dropped on return
    pub(crate) async fn serve(
        &mut self,
        listener: TcpListener,
        stop: &mut watch::Receiver<bool>,
        commands: &mut Receiver<(String, String)>,
    ) {
        self.set_status(DeviceStatus::Online).await;

        let (packet_tx, mut packet_rx) = tokio::sync::mpsc::channel::<PacketResult>(32);
        let mut connections: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("D2L connection from {peer}");
                            connections.retain(|c| !c.is_finished());
                            connections.push(tokio::spawn(read_connection(stream, peer, packet_tx.clone())));
                        },
                        Err(e) => warn!("Accepting D2L connection failed: {e}"),
                    }
                },
                Some((peer, packet)) = packet_rx.recv() => {
                    match packet {
                        Ok(packet) => self.handle_packet(&packet).await,
                        Err(e) => warn!("Dropping data from {peer}: {e}"),
                    }
                },
                Some((device, command)) = commands.recv() => {
                    self.router.apply_power_factor(&device, &command);
                },
            }
        }

        for connection in connections {
            connection.abort();
        }
    }

    async fn handle_packet(&mut self, packet: &[u8]) {
        match process_packet(&mut self.router, packet) {
            Ok(Some((device, outcome))) => publish_outcome(&self.sender, &device, outcome).await,
            Ok(None) => {}
            Err(LinkyError::UnknownDevice(id)) => info!("Packet of unconfigured D2L {id} on {} ignored", self.config.name),
            Err(e) => {
                match &e {
                    LinkyError::CryptoFailure(_) => error!("D2L packet on {} not decrypted: {e}", self.config.name),
                    _ => warn!("Invalid D2L packet on {}: {e}", self.config.name),
                }
                let identity = D2lHeader::parse(packet).ok().map(|h| DeviceIdentity::D2l(h.device_id));
                if let Some(device) = identity.and_then(|id| self.router.route_mut(Some(&id))) {
                    let count = device.record_invalid_frame();
                    let _ = self.sender.send(Transmission::InvalidFrames { device: device.name().to_string(), count }).await;
                }
            }
        }
    }

    pub fn router(&self) -> &DeviceRouter {
        &self.router
    }
}

async fn read_connection(mut stream: TcpStream, peer: SocketAddr, packets: Sender<PacketResult>) {
    let mut assembler = D2lAssembler::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                if assembler.buffered() > 0 {
                    debug!("{peer} closed with {} bytes of an incomplete packet", assembler.buffered());
                }
                break;
            }
            Ok(n) => {
                assembler.push(&buf[..n]);
                while let Some(packet) = assembler.next_packet() {
                    if packets.send((peer, packet)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("Reading from {peer} failed: {e}");
                break;
            }
        }
    }
}

/// Routes one complete packet to its device and decodes it
///
/// Control requests yield `Ok(None)`, packets of unconfigured dongles `UnknownDevice`.
pub fn process_packet(router: &mut DeviceRouter, packet: &[u8]) -> Result<Option<(String, FrameOutcome)>, LinkyError> {
    let header = D2lHeader::parse(packet)?;
    let identity = DeviceIdentity::D2l(header.device_id);

    let device = match router.route_mut(Some(&identity)) {
        Some(d) => d,
        None => return Err(LinkyError::UnknownDevice(header.device_id.to_string())),
    };

    let crypto = device
        .crypto()
        .ok_or_else(|| LinkyError::CryptoFailure(format!("no key material for {}", device.name())))?;

    match decode_packet(packet, crypto)? {
        D2lMessage::Push(fields) => {
            let outcome = device.process(&fields);
            Ok(Some((device.name().to_string(), outcome)))
        }
        D2lMessage::UpdateRequest => {
            info!("D2L {} asks for a firmware update, not answered", device.name());
            Ok(None)
        }
        D2lMessage::ClockRequest => {
            info!("D2L {} asks for the time, not answered", device.name());
            Ok(None)
        }
        D2lMessage::Unknown(t) => {
            debug!("D2L {} sent unknown payload type {t:#04X}", device.name());
            Ok(None)
        }
    }
}
