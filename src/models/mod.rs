use serde::{Deserialize, Serialize};

/// Connectivity of one logical meter as published on its status topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    /// Carries the human readable reason
    Offline(String),
    Unknown,
}

impl DeviceStatus {
    pub fn to_string(&self) -> String {
        match self {
            DeviceStatus::Online => "online".to_string(),
            DeviceStatus::Offline(_) => "offline".to_string(),
            DeviceStatus::Unknown => "unknown".to_string(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DeviceStatus::Offline(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceProtocol {
    TicSerial,
    D2l,
}

impl DeviceProtocol {
    pub fn to_string(&self) -> String {
        match self {
            DeviceProtocol::TicSerial => "TIC".to_string(),
            DeviceProtocol::D2l => "D2L".to_string(),
        }
    }
}
