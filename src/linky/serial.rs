use super::{
    device::{serial_identity, DeviceRouter, LinkyDevice},
    publish_outcome, publish_status, subscribe_power_factor,
    tic::{TicDecoder, TicFrame, TicOptions},
    LinkyError,
};
use crate::{config::TicSerialConfig, models::{DeviceProtocol, DeviceStatus}, mqtt::Transmission};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{
        mpsc::{Receiver, Sender},
        watch,
    },
};

/* Bounded wait per read so stop requests are seen promptly */
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 256;

/// Acquisition loop of one serial TIC link and the meters behind it
pub struct TicLink {
    config: TicSerialConfig,
    sender: Sender<Transmission>,
    router: DeviceRouter,
    decoder: TicDecoder,
}

impl TicLink {
    pub fn new(config: TicSerialConfig, sender: Sender<Transmission>) -> Self {
        let router = DeviceRouter::new(config.devices.iter().map(LinkyDevice::serial).collect());
        let decoder = TicDecoder::new(TicOptions {
            mode: config.mode,
            verify_checksum: config.verify_checksum,
            auto_repair: config.auto_repair,
        });

        TicLink { config, sender, router, decoder }
    }

    async fn set_status(&self, status: DeviceStatus) {
        for name in self.router.names() {
            publish_status(&self.sender, &name, DeviceProtocol::TicSerial, status.clone()).await;
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        if self.router.is_empty() {
            warn!("Serial link {} has no devices configured", self.config.name);
        }

        let mut commands = subscribe_power_factor(&self.sender, &self.router.names()).await;

        #[cfg(feature = "serial")]
        {
            let mut port = match open_port(&self.config) {
                Ok(port) => port,
                Err(e) => {
                    error!("Serial link {} can not be opened: {e}", self.config.name);
                    self.set_status(DeviceStatus::Offline(e.to_string())).await;
                    return;
                }
            };

            info!("Serial link {} opened on {} at {} baud", self.config.name, self.config.port, self.config.baud_rate());
            self.set_status(DeviceStatus::Online).await;

            let reason = match self.acquire(&mut port, &mut stop, &mut commands).await {
                Ok(()) => "stopped".to_string(),
                Err(e) => {
                    error!("Serial link {} failed: {e}", self.config.name);
                    e.to_string()
                }
            };
            self.set_status(DeviceStatus::Offline(reason)).await;
        }

        #[cfg(not(feature = "serial"))]
        {
            let _ = (&mut stop, &mut commands);
            error!("Serial link {} configured but serial support is not compiled in", self.config.name);
            self.set_status(DeviceStatus::Offline("serial support not compiled in".to_string())).await;
        }
    }

    /// Reads until stopped or the port fails, the port is flushed and shut down on every exit
    pub(crate) async fn acquire<P>(
        &mut self,
        port: &mut P,
        stop: &mut watch::Receiver<bool>,
        commands: &mut Receiver<(String, String)>,
    ) -> Result<(), LinkyError>
    where
        P: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.read_loop(port, stop, commands).await;

        if let Err(e) = port.flush().await {
            debug!("Flushing {} failed: {e}", self.config.port);
        }
        if let Err(e) = port.shutdown().await {
            debug!("Closing {} failed: {e}", self.config.port);
        }
        self.decoder.reset();

        result
    }

    async fn read_loop<P>(
        &mut self,
        port: &mut P,
        stop: &mut watch::Receiver<bool>,
        commands: &mut Receiver<(String, String)>,
    ) -> Result<(), LinkyError>
    where
        P: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                },
                Some((device, command)) = commands.recv() => {
                    self.router.apply_power_factor(&device, &command);
                },
                read = tokio::time::timeout(READ_TIMEOUT, port.read(&mut buf)) => {
                    match read {
                        Err(_) => continue,
                        Ok(Ok(0)) => {
                            if self.decoder.in_frame() {
                                debug!("Partial frame on {} discarded", self.config.name);
                            }
                            return Err(LinkyError::StreamClosed);
                        },
                        Ok(Ok(n)) => {
                            for result in self.decoder.feed(&buf[..n]) {
                                self.handle(result).await;
                            }
                        },
                        Ok(Err(e)) => return Err(LinkyError::ResourceFailure(format!("{}: {e}", self.config.port))),
                    }
                },
            }
        }
    }

    async fn handle(&mut self, result: Result<TicFrame, LinkyError>) {
        match result {
            Ok(frame) => {
                let fields = frame.to_fields();
                let identity = serial_identity(&fields);
                match self.router.route_mut(identity.as_ref()) {
                    Some(device) => {
                        let outcome = device.process(&fields);
                        publish_outcome(&self.sender, device.name(), outcome).await;
                    }
                    None => info!("Frame of meter {:?} on {} matches no configured device", identity, self.config.name),
                }
            }
            Err(e) => {
                /* The meter can not be told apart on a broken frame, every device of the link counts it */
                warn!("Invalid frame on {}: {e}", self.config.name);
                for device in self.router.devices_mut() {
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

#[cfg(feature = "serial")]
fn open_port(config: &TicSerialConfig) -> Result<tokio_serial::SerialStream, LinkyError> {
    use tokio_serial::SerialPortBuilderExt;

    /* Both dialects use 7 data bits, even parity, one stop bit */
    tokio_serial::new(&config.port, config.baud_rate())
        .data_bits(tokio_serial::DataBits::Seven)
        .parity(tokio_serial::Parity::Even)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open_native_async()
        .map_err(|e| LinkyError::ResourceFailure(format!("{}: {e}", config.port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TicDeviceConfig;
    use crate::linky::tic::{encode_frame, encode_group, TicMode};
    use crate::mqtt::{to_publish, PublishData};

    fn config(mode: TicMode, auto_repair: bool, devices: Vec<TicDeviceConfig>) -> TicSerialConfig {
        TicSerialConfig {
            name: "link".to_string(),
            port: "/dev/null".to_string(),
            mode,
            baud_rate: None,
            auto_repair,
            verify_checksum: true,
            devices,
        }
    }

    fn device(name: &str, prm: Option<&str>) -> TicDeviceConfig {
        TicDeviceConfig { name: name.to_string(), prm: prm.map(|p| p.to_string()), power_factor: None }
    }

    fn drain(rx: &mut Receiver<Transmission>) -> Vec<PublishData> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            if let Some(p) = to_publish(&t) {
                out.push(p);
            }
        }
        out
    }

    fn garbled_adps(value: &str) -> Vec<u8> {
        let mut bad = encode_group(TicMode::Extended, "ADPS", None, value);
        bad.remove(4);
        bad
    }

    async fn feed(link: &mut TicLink, stream: &[u8]) -> Result<(), LinkyError> {
        let (mut meter, mut port) = tokio::io::duplex(4096);
        meter.write_all(stream).await.unwrap();
        drop(meter);

        let (_stop_tx, mut stop) = watch::channel(false);
        let (_cmd_tx, mut commands) = tokio::sync::mpsc::channel(1);
        link.acquire(&mut port, &mut stop, &mut commands).await
    }

    #[tokio::test]
    async fn test_repaired_frame_end_to_end() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let mut link = TicLink::new(config(TicMode::Extended, true, vec![device("linky", None)]), tx);

        let frame = encode_frame(&[
            encode_group(TicMode::Extended, "SINSTS", None, "02200"),
            garbled_adps("031"),
        ]);
        assert_eq!(feed(&mut link, &frame).await, Err(LinkyError::StreamClosed));

        let published = drain(&mut rx);
        let topics: Vec<&str> = published.iter().map(|p| p.topic.as_str()).collect();
        assert!(topics.contains(&"linky2mqtt/devs/linky/power/sinsts"));
        let adps = published.iter().find(|p| p.topic == "linky2mqtt/devs/linky/current/adps").unwrap();
        assert_eq!(adps.payload, "31");
        assert!(!topics.iter().any(|t| t.ends_with("invalid_frames")));
        assert_eq!(link.router().devices()[0].invalid_frames(), 0);
    }

    #[tokio::test]
    async fn test_garbled_frame_counted_without_repair() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let mut link = TicLink::new(config(TicMode::Extended, false, vec![device("linky", None)]), tx);

        let frame = encode_frame(&[
            encode_group(TicMode::Extended, "SINSTS", None, "02200"),
            garbled_adps("031"),
        ]);
        assert_eq!(feed(&mut link, &frame).await, Err(LinkyError::StreamClosed));

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "linky2mqtt/devs/linky/status/invalid_frames");
        assert_eq!(published[0].payload, "1");
        assert_eq!(link.router().devices()[0].invalid_frames(), 1);
    }

    #[tokio::test]
    async fn test_frames_routed_by_prm() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let devices = vec![device("a", Some("041876097474")), device("b", Some("041876097475"))];
        let mut link = TicLink::new(config(TicMode::Extended, false, devices), tx);

        let mut stream = encode_frame(&[
            encode_group(TicMode::Extended, "ADSC", None, "041876097475"),
            encode_group(TicMode::Extended, "URMS1", None, "231"),
        ]);
        stream.extend(encode_frame(&[
            encode_group(TicMode::Extended, "ADSC", None, "999999999999"),
            encode_group(TicMode::Extended, "URMS1", None, "232"),
        ]));
        let _ = feed(&mut link, &stream).await;

        let published = drain(&mut rx);
        assert!(published.iter().any(|p| p.topic == "linky2mqtt/devs/b/voltage/urms1" && p.payload == "231"));
        assert!(!published.iter().any(|p| p.topic.starts_with("linky2mqtt/devs/a/")));
        assert!(!published.iter().any(|p| p.payload == "232"));
    }

    #[tokio::test]
    async fn test_capabilities_published_once() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let mut link = TicLink::new(config(TicMode::Legacy, false, vec![device("cbe", None)]), tx);

        let frame = encode_frame(&[
            encode_group(TicMode::Legacy, "ADCO", None, "031428097115"),
            encode_group(TicMode::Legacy, "PAPP", None, "01000"),
        ]);
        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);
        let _ = feed(&mut link, &stream).await;

        let published = drain(&mut rx);
        let caps: Vec<&PublishData> = published.iter().filter(|p| p.topic.ends_with("/capabilities")).collect();
        assert_eq!(caps.len(), 1);
        assert_eq!(published.iter().filter(|p| p.topic == "linky2mqtt/devs/cbe/power/papp").count(), 2);
    }

    #[tokio::test]
    async fn test_stop_interrupts_read() {
        let (tx, _rx) = tokio::sync::mpsc::channel(100);
        let mut link = TicLink::new(config(TicMode::Legacy, false, vec![device("cbe", None)]), tx);

        /* Keep the meter side open so the read never ends on its own */
        let (_meter, mut port) = tokio::io::duplex(64);
        let (stop_tx, mut stop) = watch::channel(false);
        let (_cmd_tx, mut commands) = tokio::sync::mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let result = link.acquire(&mut port, &mut stop, &mut commands).await;
            (result, link)
        });
        stop_tx.send(true).unwrap();

        let (result, _) = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_manager_stop_closes_port() {
        let (tx, _rx) = tokio::sync::mpsc::channel(100);
        let manager = crate::linky::LinkyManager::new(tx.clone());
        let handle = manager.stop_handle();
        let mut link = TicLink::new(config(TicMode::Legacy, false, vec![device("cbe", None)]), tx);

        let (mut meter, mut port) = tokio::io::duplex(64);
        let mut stop = handle.subscribe();
        let (_cmd_tx, mut commands) = tokio::sync::mpsc::channel(1);

        let task = tokio::spawn(async move { link.acquire(&mut port, &mut stop, &mut commands).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        /* The manager itself is gone, the handle still reaches the loop */
        drop(manager);
        handle.stop();

        let result = tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));

        let mut buf = [0u8; 8];
        assert_eq!(meter.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_power_factor_command_applied() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let mut link = TicLink::new(config(TicMode::Legacy, false, vec![device("cbe", None)]), tx);

        let (mut meter, mut port) = tokio::io::duplex(4096);
        let (_stop_tx, mut stop) = watch::channel(false);
        let (cmd_tx, mut commands) = tokio::sync::mpsc::channel(4);

        cmd_tx.send(("cbe".to_string(), "0.5".to_string())).await.unwrap();
        cmd_tx.send(("cbe".to_string(), "7".to_string())).await.unwrap();

        let handle = tokio::spawn(async move {
            let result = link.acquire(&mut port, &mut stop, &mut commands).await;
            (result, link)
        });

        /* Give the loop time to take the commands before the frame arrives */
        tokio::time::sleep(Duration::from_millis(100)).await;
        let frame = encode_frame(&[encode_group(TicMode::Legacy, "PAPP", None, "01000")]);
        meter.write_all(&frame).await.unwrap();
        drop(meter);

        let (result, link) = handle.await.unwrap();
        assert_eq!(result, Err(LinkyError::StreamClosed));
        assert_eq!(link.router().devices()[0].power_factor(), Some(0.5));

        let published = drain(&mut rx);
        let active = published.iter().find(|p| p.topic == "linky2mqtt/devs/cbe/derived/active_power").unwrap();
        assert_eq!(active.payload, "500");
    }
}
