use super::{
    d2l::CryptoContext,
    derived,
    fields::ChannelField,
    interpreter::{self, DecodedMeasurement},
    registers::StatusRegister,
    ChannelEvent, ChannelValue, LinkyError,
};
use crate::config::{D2lDeviceConfig, TicDeviceConfig};
use log::{debug, info, warn};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceIdentity {
    /// Id from the D2L envelope header
    D2l(u64),
    /// Point of delivery reported by the meter itself
    Prm(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MeterCapabilities {
    pub three_phase: bool,
    pub producer: bool,
}

impl MeterCapabilities {
    pub fn detect(measurements: &[DecodedMeasurement]) -> Self {
        let mut caps = MeterCapabilities::default();

        for m in measurements {
            let field = match m.field {
                Some(f) => f,
                None => continue,
            };

            if field.phase.is_some_and(|p| p >= 2) {
                caps.three_phase = true;
            }
            if field.producer {
                caps.producer = true;
            }
            if field.label == "STGE" && m.channel == field.channel() {
                if let ChannelValue::Text(raw) = &m.value {
                    if StatusRegister::from_hex(raw).is_ok_and(|r| r.is_producer()) {
                        caps.producer = true;
                    }
                }
            }
        }

        caps
    }

    pub fn applies_to(&self, field: &ChannelField) -> bool {
        let phase_ok = field.phase.map_or(true, |p| p < 2 || self.three_phase);
        phase_ok && (!field.producer || self.producer)
    }
}

/// Result of feeding one accepted frame to a device
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameOutcome {
    pub events: Vec<ChannelEvent>,
    /// Set on the first frame only
    pub capabilities: Option<MeterCapabilities>,
}

fn validate_power_factor(value: f64) -> Option<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Some(value)
    } else {
        None
    }
}

/// One logical meter with the state that belongs to it alone
#[derive(Debug)]
pub struct LinkyDevice {
    name: String,
    identity: Option<DeviceIdentity>,
    crypto: Option<CryptoContext>,
    invalid_frames: u64,
    capabilities: Option<MeterCapabilities>,
    power_factor: Option<f64>,
}

impl LinkyDevice {
    fn new(name: &str, identity: Option<DeviceIdentity>, crypto: Option<CryptoContext>, power_factor: Option<f64>) -> Self {
        let validated = power_factor.and_then(validate_power_factor);
        if power_factor.is_some() && validated.is_none() {
            warn!("Ignoring configured power factor {:?} of {}, it must be within [0, 1]", power_factor, name);
        }

        LinkyDevice {
            name: name.to_string(),
            identity,
            crypto,
            invalid_frames: 0,
            capabilities: None,
            power_factor: validated,
        }
    }

    pub fn serial(config: &TicDeviceConfig) -> Self {
        let identity = config.prm.as_ref().map(|p| DeviceIdentity::Prm(p.trim().to_string()));
        Self::new(&config.name, identity, None, config.power_factor)
    }

    pub fn d2l(config: &D2lDeviceConfig) -> Result<Self, LinkyError> {
        let crypto = CryptoContext::from_hex(&config.app_key, &config.iv_key)?;
        Ok(Self::new(&config.name, Some(DeviceIdentity::D2l(config.id)), Some(crypto), config.power_factor))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crypto(&self) -> Option<&CryptoContext> {
        self.crypto.as_ref()
    }

    /// A device without configured identity takes every frame of its link
    pub fn matches(&self, identity: Option<&DeviceIdentity>) -> bool {
        match (&self.identity, identity) {
            (None, _) => true,
            (Some(own), Some(other)) => own == other,
            (Some(_), None) => false,
        }
    }

    pub fn record_invalid_frame(&mut self) -> u64 {
        self.invalid_frames += 1;
        self.invalid_frames
    }

    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames
    }

    pub fn capabilities(&self) -> Option<MeterCapabilities> {
        self.capabilities
    }

    pub fn power_factor(&self) -> Option<f64> {
        self.power_factor
    }

    /// Applies a power factor command, the previous value is kept when the command is rejected
    pub fn set_power_factor(&mut self, raw: &str) -> Result<f64, LinkyError> {
        let parsed = raw.trim().parse::<f64>().ok().and_then(validate_power_factor);
        match parsed {
            Some(pf) => {
                info!("Power factor of {} set to {}", self.name, pf);
                self.power_factor = Some(pf);
                Ok(pf)
            }
            None => Err(LinkyError::UnparsableField { label: "power_factor".to_string(), value: raw.to_string() }),
        }
    }

    pub fn process(&mut self, fields: &[(String, String)]) -> FrameOutcome {
        let measurements = interpreter::interpret(fields);
        let mut outcome = FrameOutcome::default();

        let caps = match self.capabilities {
            Some(caps) => caps,
            None => {
                let caps = MeterCapabilities::detect(&measurements);
                info!("{} detected as {} phase {}", self.name,
                    if caps.three_phase { "three" } else { "single" },
                    if caps.producer { "producer" } else { "consumer" });
                self.capabilities = Some(caps);
                outcome.capabilities = Some(caps);
                caps
            }
        };

        let primary = |label: &str| -> Option<f64> {
            measurements
                .iter()
                .find(|m| m.field.is_some_and(|f| f.label == label && m.channel == f.channel()))
                .and_then(|m| m.value.as_f64())
        };
        let apparent = primary("SINSTS").or_else(|| primary("PAPP"));
        let derived = derived::compute(apparent, primary("URMS1"), self.power_factor);

        for m in measurements {
            if m.field.is_some_and(|f| !caps.applies_to(f)) {
                continue;
            }
            outcome.events.push(ChannelEvent {
                device: self.name.clone(),
                group: m.group.to_string(),
                channel: m.channel,
                value: m.value,
            });
        }

        for (channel, value) in derived.channels() {
            outcome.events.push(ChannelEvent {
                device: self.name.clone(),
                group: "derived".to_string(),
                channel: channel.to_string(),
                value,
            });
        }

        outcome
    }
}

/// Meter address carried inside a serial frame
pub fn serial_identity(fields: &[(String, String)]) -> Option<DeviceIdentity> {
    fields
        .iter()
        .find(|(label, _)| label == "ADSC" || label == "ADCO")
        .map(|(_, value)| DeviceIdentity::Prm(value.trim().to_string()))
}

/// Devices sharing one link or listener, first match wins
#[derive(Debug, Default)]
pub struct DeviceRouter {
    devices: Vec<LinkyDevice>,
}

impl DeviceRouter {
    pub fn new(devices: Vec<LinkyDevice>) -> Self {
        DeviceRouter { devices }
    }

    pub fn route_mut(&mut self, identity: Option<&DeviceIdentity>) -> Option<&mut LinkyDevice> {
        self.devices.iter_mut().find(|d| d.matches(identity))
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut LinkyDevice> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    /// Routes a power factor command to the named device, rejected commands are only logged
    pub fn apply_power_factor(&mut self, device: &str, command: &str) {
        match self.by_name_mut(device) {
            Some(d) => {
                if let Err(e) = d.set_power_factor(command) {
                    warn!("Power factor command for {device} rejected: {e}");
                }
            }
            None => debug!("Power factor command for unknown device {device}"),
        }
    }

    pub fn devices(&self) -> &[LinkyDevice] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [LinkyDevice] {
        &mut self.devices
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
