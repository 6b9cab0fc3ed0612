use super::{ChannelValue, ContactState, LinkyError};
use log::debug;

/// One contiguous bit range of the STGE register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusField {
    pub name: &'static str,
    pub offset: u8,
    pub width: u8,
    /// Rendered as open/closed instead of a plain integer
    pub contact: bool,
}

const fn bits(name: &'static str, offset: u8, width: u8) -> StatusField {
    StatusField { name, offset, width, contact: false }
}

const fn contact(name: &'static str, offset: u8) -> StatusField {
    StatusField { name, offset, width: 1, contact: true }
}

/* Bits 5 and 18 are reserved and not listed */
pub static STATUS_FIELDS: [StatusField; 18] = [
    contact("contactor", 0),
    bits("cutoff", 1, 3),
    contact("cache", 4),
    bits("over_voltage", 6, 1),
    bits("exceeding_power", 7, 1),
    bits("function", 8, 1),
    bits("direction", 9, 1),
    bits("supplier_rate", 10, 4),
    bits("distributor_rate", 14, 2),
    bits("clock", 16, 1),
    bits("plc", 17, 1),
    bits("com_output", 19, 2),
    bits("plc_state", 21, 2),
    bits("plc_sync", 23, 1),
    bits("tempo_today", 24, 2),
    bits("tempo_tomorrow", 26, 2),
    bits("moving_tips_advice", 28, 2),
    bits("moving_tips", 30, 2),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRegister(pub u32);

impl StatusRegister {
    pub fn from_bits(bits: u32) -> Self {
        StatusRegister(bits)
    }

    /// Meters report the register as 8 hex digits
    pub fn from_hex(raw: &str) -> Result<Self, LinkyError> {
        u32::from_str_radix(raw.trim(), 16)
            .map(Self::from_bits)
            .map_err(|_| LinkyError::UnparsableField { label: "STGE".to_string(), value: raw.to_string() })
    }

    pub fn slice(&self, field: &StatusField) -> u32 {
        (self.0 >> field.offset) & ((1u32 << field.width) - 1)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        STATUS_FIELDS.iter().find(|f| f.name == name).map(|f| self.slice(f))
    }

    pub fn decode(&self) -> Vec<(&'static str, ChannelValue)> {
        STATUS_FIELDS
            .iter()
            .map(|f| {
                let raw = self.slice(f);
                let value = match (f.contact, raw) {
                    (true, 1) => ChannelValue::Contact(ContactState::Open),
                    (true, _) => ChannelValue::Contact(ContactState::Closed),
                    (false, v) => ChannelValue::Integer(v as u64),
                };
                (f.name, value)
            })
            .collect()
    }

    /// Function bit set means the meter runs in producer mode
    pub fn is_producer(&self) -> bool {
        self.get("function") == Some(1)
    }
}

/// RELAIS holds the state of the 8 virtual relays as a decimal number, relay 1 is the lowest bit
pub fn decode_relays(raw: &str) -> Result<[bool; 8], LinkyError> {
    let value: u8 = raw
        .trim()
        .parse()
        .map_err(|_| LinkyError::UnparsableField { label: "RELAIS".to_string(), value: raw.to_string() })?;

    let mut relays = [false; 8];
    for (i, relay) in relays.iter_mut().enumerate() {
        *relay = value & (1 << i) != 0;
    }
    Ok(relays)
}

static TARIFF_COLORS: [(u16, &str); 6] = [
    (1, "Bleue-HC"),
    (2, "Bleue-HP"),
    (3, "Blanc-HC"),
    (4, "Blanc-HP"),
    (5, "Red-HC"),
    (6, "Red-HP"),
];

const UNUSED_RECORD: &str = "NONUTILE";

/// One switching point of the next day / peak day profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Position of the sub-record in the block, starting at 1
    pub index: usize,
    pub start: String,
    pub tariff: Option<&'static str>,
    pub relay: Option<&'static str>,
}

/// Decodes a PJOURF+1 / PPOINTE block of `HHMMSSSS` sub-records
pub fn decode_schedule(raw: &str) -> Vec<ScheduleEntry> {
    let mut entries = Vec::new();

    for (i, record) in raw.split_whitespace().enumerate() {
        if record.contains(UNUSED_RECORD) {
            continue;
        }

        match decode_schedule_record(i + 1, record) {
            Some(entry) => entries.push(entry),
            None => debug!("Skipping undecodable schedule record {record:?}"),
        }
    }

    entries
}

fn decode_schedule_record(index: usize, record: &str) -> Option<ScheduleEntry> {
    if record.len() != 8 || !record.is_ascii() {
        return None;
    }

    let hour: u8 = record[0..2].parse().ok()?;
    let minute: u8 = record[2..4].parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }

    let action = u16::from_str_radix(&record[4..8], 16).ok()?;

    let tariff = TARIFF_COLORS.iter().find(|(i, _)| *i == action & 0x0F).map(|(_, name)| *name);
    let relay = match (action >> 14) & 0x03 {
        0 => Some("Fermé"),
        1 => Some("Ouvert"),
        _ => None,
    };

    Some(ScheduleEntry {
        index,
        start: format!("{:02}:{:02}", hour, minute),
        tariff,
        relay,
    })
}
