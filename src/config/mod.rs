use lazy_static::lazy_static;
use log::info;
use serde::{Deserialize, Serialize};
use serde_yml;
#[cfg(feature = "api")]
use utoipa::ToSchema;
use std::error::Error;
use std::fs::File;
use std::io::prelude::*;
use std::sync::RwLock;

use crate::linky::tic::TicMode;

fn httpd_enabled_default() -> bool { return true }
fn httpd_port_default() -> u16 { return 8240 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HttpdConfig {
    #[serde(default="httpd_enabled_default")]
    pub enabled: bool,
    #[serde(default="httpd_port_default")]
    pub port: u16
}

fn mqtt_client_name_default() -> String { return "linky2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /* Never handed out by the config endpoint */
    #[serde(skip_serializing)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "api", derive(ToSchema))]
pub struct TicDeviceConfig {
    pub name: String,
    /// Meter address (ADSC / ADCO), without it the device takes every frame of the link
    #[serde(default)]
    pub prm: Option<String>,
    #[serde(default)]
    pub power_factor: Option<f64>,
}

fn tic_checksum_default() -> bool { return true }
fn tic_auto_repair_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "api", derive(ToSchema))]
pub struct TicSerialConfig {
    pub name: String,
    pub port: String,
    #[cfg_attr(feature = "api", schema(value_type = String))]
    pub mode: TicMode,
    /// Defaults to the rate of the mode
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default="tic_auto_repair_default")]
    pub auto_repair: bool,
    #[serde(default="tic_checksum_default")]
    pub verify_checksum: bool,
    pub devices: Vec<TicDeviceConfig>,
}

impl TicSerialConfig {
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(self.mode.default_baud_rate())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "api", derive(ToSchema))]
pub struct D2lDeviceConfig {
    pub name: String,
    pub id: u64,
    #[serde(skip_serializing)]
    pub app_key: String,
    #[serde(skip_serializing)]
    pub iv_key: String,
    #[serde(default)]
    pub power_factor: Option<f64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "api", derive(ToSchema))]
pub struct D2lListenerConfig {
    pub name: String,
    pub port: u16,
    pub devices: Vec<D2lDeviceConfig>,
}

fn httpd_default() -> HttpdConfig { return  HttpdConfig{ enabled: httpd_enabled_default(), port: httpd_port_default() }}
fn serial_default() -> Vec<TicSerialConfig> { return Vec::new(); }
fn d2l_default() -> Vec<D2lListenerConfig> { return Vec::new(); }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="httpd_default")]
    pub httpd: HttpdConfig,
    pub mqtt: MqttConfig,
    #[serde(default="serial_default")]
    pub serial: Vec<TicSerialConfig>,
    #[serde(default="d2l_default")]
    pub d2l: Vec<D2lListenerConfig>,
}

impl Config {
    /// The names are used as topic segments, they have to be unique across all links
    pub fn device_names(&self) -> Vec<String> {
        let serial = self.serial.iter().flat_map(|l| l.devices.iter().map(|d| d.name.clone()));
        let d2l = self.d2l.iter().flat_map(|l| l.devices.iter().map(|d| d.name.clone()));
        serial.chain(d2l).collect()
    }
}

pub struct ConfigHolder {
    pub config: Config,
    pub lock: RwLock<bool>,
    pub path: String,
}

pub enum ConfigBases {
    Httpd(HttpdConfig),
    Mqtt(MqttConfig),
    Serial(Vec<TicSerialConfig>),
    D2l(Vec<D2lListenerConfig>),
}

impl ConfigHolder {
    pub fn load() -> Self {
        /* An explicit path wins over the two default locations */
        let path = match std::env::var("L2M_CONFIG") {
            Ok(p) => p,
            Err(_) => {
                if std::path::Path::new("config/l2m.yaml").exists() {
                    "config/l2m.yaml".to_string()
                } else {
                    "l2m.yaml".to_string()
                }
            }
        };

        match Self::from_file(&path) {
            Ok(c) => c,
            Err(e) => panic!("Unable to read the config on {path}: {e}"),
        }
    }

    pub fn from_file(path: &str) -> Result<Self, Box<dyn Error>> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let mut holder = Self::from_yaml(&contents)?;
        holder.path = path.to_string();
        info!("Configuration loaded from {path}");
        return Ok(holder);
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Box<dyn Error>> {
        let c: Config = serde_yml::from_str(contents)?;

        let mut names = c.device_names();
        let total = names.len();
        names.sort();
        names.dedup();
        if names.len() != total {
            Err("Device names have to be unique")?
        }

        return Ok(ConfigHolder {
            config: c,
            lock: RwLock::new(true),
            path: String::new(),
        });
    }

    pub fn get_copy(&self, base: &str) -> Result<ConfigBases, Box<dyn Error>> {
        /* Lock against modifications during copy */
        let _lock = self.lock.read().map_err(|_| "Config lock poisoned")?;

        match base {
            "httpd" => { return Ok(ConfigBases::Httpd(self.config.httpd.clone())) },
            "mqtt" => { return Ok(ConfigBases::Mqtt(self.config.mqtt.clone())) },
            "serial" => { return Ok(ConfigBases::Serial(self.config.serial.clone())) },
            "d2l" => { return Ok(ConfigBases::D2l(self.config.d2l.clone())) },
            _ => { Err("Type not known")? }
        }
    }

    pub fn get_complete_config(&self) -> Config {
        return self.config.clone();
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(ConfigHolder::load());
}

#[macro_export]
macro_rules! get_config_or_panic {
    ($base: expr, $pat: path) => {
        {
            let c = CONFIG.read().unwrap().get_copy($base).unwrap();
            if let $pat(a) = c {
                a
            } else {
                panic!(
                    "mismatch variant when cast to {}",
                    stringify!($pat));
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
mqtt:
  host: localhost
  port: 1883
  user: user
  pass: secret
serial:
  - name: garage
    port: /dev/ttyUSB0
    mode: Extended
    devices:
      - name: linky
        prm: "09000000000000"
        power_factor: 0.95
  - name: old
    port: /dev/ttyUSB1
    mode: Legacy
    baud_rate: 9600
    auto_repair: false
    verify_checksum: false
    devices:
      - name: cbe
d2l:
  - name: dongles
    port: 7845
    devices:
      - name: d2l
        id: 1234567890
        app_key: "000102030405060708090a0b0c0d0e0f"
        iv_key: "0f0e0d0c0b0a09080706050403020100"
"#;

    #[test]
    fn test_defaults() {
        let holder = ConfigHolder::from_yaml(SAMPLE).unwrap();
        let c = holder.get_complete_config();
        assert!(c.httpd.enabled);
        assert_eq!(c.httpd.port, 8240);
        assert_eq!(c.mqtt.client_name, "linky2mqtt");

        assert_eq!(c.serial[0].mode, TicMode::Extended);
        assert_eq!(c.serial[0].baud_rate(), 9600);
        assert!(c.serial[0].auto_repair);
        assert!(c.serial[0].verify_checksum);
        assert_eq!(c.serial[0].devices[0].prm.as_deref(), Some("09000000000000"));
        assert_eq!(c.serial[0].devices[0].power_factor, Some(0.95));

        assert_eq!(c.serial[1].baud_rate(), 9600);
        assert!(!c.serial[1].auto_repair);
        assert_eq!(c.serial[1].devices[0].prm, None);

        assert_eq!(c.d2l[0].devices[0].id, 1234567890);
        assert_eq!(c.device_names(), vec!["linky", "cbe", "d2l"]);
    }

    #[test]
    fn test_get_copy() {
        let holder = ConfigHolder::from_yaml(SAMPLE).unwrap();
        match holder.get_copy("serial").unwrap() {
            ConfigBases::Serial(links) => assert_eq!(links.len(), 2),
            _ => panic!("wrong base"),
        }
        match holder.get_copy("d2l").unwrap() {
            ConfigBases::D2l(listeners) => assert_eq!(listeners[0].port, 7845),
            _ => panic!("wrong base"),
        }
        assert!(holder.get_copy("modbus").is_err());
    }

    #[test]
    fn test_minimal_config() {
        let holder = ConfigHolder::from_yaml("mqtt: { host: h, port: 1, user: u, pass: p }").unwrap();
        assert!(holder.config.serial.is_empty());
        assert!(holder.config.d2l.is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = SAMPLE.replace("- name: cbe", "- name: linky");
        assert!(ConfigHolder::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let yaml = SAMPLE.replace("mode: Legacy", "mode: Auto");
        assert!(ConfigHolder::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_secrets_not_serialized() {
        let holder = ConfigHolder::from_yaml(SAMPLE).unwrap();
        let json = serde_json::to_string(&holder.get_complete_config()).unwrap();
        assert!(!json.contains("000102030405060708090a0b0c0d0e0f"));
        assert!(!json.contains("0f0e0d0c0b0a09080706050403020100"));
        assert!(!json.contains("secret"));
        assert!(json.contains("1234567890"));

        /* The loaded config still carries them */
        assert_eq!(holder.config.d2l[0].devices[0].app_key, "000102030405060708090a0b0c0d0e0f");
        assert_eq!(holder.config.mqtt.pass, "secret");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let holder = ConfigHolder::from_file(&path).unwrap();
        assert_eq!(holder.path, path);
        assert_eq!(holder.config.serial[0].name, "garage");

        assert!(ConfigHolder::from_file("/nonexistent/l2m.yaml").is_err());
    }
}
