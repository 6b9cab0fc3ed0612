use super::{
    fields::{self, ChannelField, FieldKind},
    registers::{self, StatusRegister},
    ChannelValue, LinkyError,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use log::{debug, trace};

/// Meters report local time, decoded values are pinned to UTC+1
const METER_OFFSET_SECS: i32 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMeasurement {
    /// Table entry the measurement originates from, `None` for computed ones
    pub field: Option<&'static ChannelField>,
    pub group: &'static str,
    pub channel: String,
    pub value: ChannelValue,
}

impl DecodedMeasurement {
    fn new(field: &'static ChannelField, channel: String, value: ChannelValue) -> Self {
        DecodedMeasurement { field: Some(field), group: field.group, channel, value }
    }
}

/// Accepts `SYYMMDD[hh][mm][ss]` (season marker first) and `Mon DD YYYY`
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let naive = parse_compact(raw).or_else(|| {
        NaiveDate::parse_from_str(raw, "%b %d %Y").ok().and_then(|d| d.and_hms_opt(0, 0, 0))
    })?;

    FixedOffset::east_opt(METER_OFFSET_SECS)?.from_local_datetime(&naive).single()
}

fn parse_compact(raw: &str) -> Option<NaiveDateTime> {
    let mut chars = raw.chars();
    let marker = chars.next()?;
    let digits = chars.as_str();

    if marker.is_ascii_digit() || !matches!(digits.len(), 6 | 8 | 10 | 12) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let part = |i: usize| -> u32 {
        digits.get(i * 2..i * 2 + 2).and_then(|p| p.parse().ok()).unwrap_or(0)
    };

    let date = NaiveDate::from_ymd_opt(2000 + part(0) as i32, part(1), part(2))?;
    date.and_hms_opt(part(3), part(4), part(5))
}

fn unparsable(label: &str, value: &str) -> LinkyError {
    LinkyError::UnparsableField { label: label.to_string(), value: value.to_string() }
}

/// Decodes one (label, value) pair, `raw` may carry a `<timestamp>|` prefix
pub fn decode_field(field: &'static ChannelField, raw: &str) -> Result<Vec<DecodedMeasurement>, LinkyError> {
    let mut out = Vec::new();

    let splittable = field.kind != FieldKind::Text || field.timestamp_channel.is_some();
    let (stamp, value) = match raw.split_once('|') {
        Some((ts, v)) if splittable => (Some(ts), v.trim()),
        _ => (None, raw.trim()),
    };

    if let (Some(ts), Some(channel)) = (stamp, field.timestamp_channel) {
        match parse_timestamp(ts) {
            Some(ts) => out.push(DecodedMeasurement::new(field, channel.to_string(), ChannelValue::Timestamp(ts))),
            None => debug!("Timestamp {ts:?} of {} can not be decoded", field.label),
        }
    }

    match field.kind {
        FieldKind::Ignored => {}
        FieldKind::Text => {
            if !value.is_empty() {
                out.push(DecodedMeasurement::new(field, field.channel(), ChannelValue::Text(value.to_string())));
            }
        }
        FieldKind::Integer => {
            if !value.is_empty() {
                let n: u64 = value.parse().map_err(|_| unparsable(field.label, raw))?;
                let value = if field.unit.is_empty() && field.scale == 1.0 {
                    ChannelValue::Integer(n)
                } else {
                    ChannelValue::Quantity { value: n as f64 * field.scale, unit: field.unit }
                };
                out.push(DecodedMeasurement::new(field, field.channel(), value));
            }
        }
        FieldKind::Timestamp => {
            /* DATE of the extended dialect carries an empty value next to its timestamp */
            let source = match (value.is_empty(), stamp) {
                (true, Some(ts)) => ts,
                _ => value,
            };
            if !source.trim().is_empty() {
                let ts = parse_timestamp(source).ok_or_else(|| unparsable(field.label, raw))?;
                out.push(DecodedMeasurement::new(field, field.channel(), ChannelValue::Timestamp(ts)));
            }
        }
    }

    /* The plain value stays published when the detailed decode fails */
    if let Err(e) = decode_special(field, value, &mut out) {
        debug!("{e}");
    }
    Ok(out)
}

fn decode_special(field: &'static ChannelField, value: &str, out: &mut Vec<DecodedMeasurement>) -> Result<(), LinkyError> {
    match field.label {
        "STGE" => {
            let register = StatusRegister::from_hex(value)?;
            for (name, value) in register.decode() {
                out.push(DecodedMeasurement::new(field, name.to_string(), value));
            }
        }
        "RELAIS" => {
            let relays = registers::decode_relays(value)?;
            for (i, state) in relays.iter().enumerate() {
                out.push(DecodedMeasurement::new(field, format!("relay{}", i + 1), ChannelValue::Switch(*state)));
            }
        }
        "PJOURF+1" | "PPOINTE" => {
            let prefix = field.channel();
            for entry in registers::decode_schedule(value) {
                out.push(DecodedMeasurement::new(field, format!("{}_{}_time", prefix, entry.index), ChannelValue::Text(entry.start)));
                if let Some(tariff) = entry.tariff {
                    out.push(DecodedMeasurement::new(field, format!("{}_{}_tariff", prefix, entry.index), ChannelValue::Text(tariff.to_string())));
                }
                if let Some(relay) = entry.relay {
                    out.push(DecodedMeasurement::new(field, format!("{}_{}_relay", prefix, entry.index), ChannelValue::Text(relay.to_string())));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decodes a whole frame in field order, fields failing to decode are skipped
pub fn interpret(frame: &[(String, String)]) -> Vec<DecodedMeasurement> {
    let mut out = Vec::new();

    for (label, raw) in frame {
        let field = match fields::lookup(label) {
            Some(f) => f,
            None => {
                trace!("Skipping unknown field {label}");
                continue;
            }
        };

        match decode_field(field, raw) {
            Ok(mut decoded) => out.append(&mut decoded),
            Err(e) => debug!("{e}"),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn frame(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(l, v)| (l.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_compact_timestamps() {
        let ts = parse_timestamp("H200101083005").unwrap();
        assert_eq!(ts.to_rfc3339(), "2020-01-01T08:30:05+01:00");

        let ts = parse_timestamp("E2406151045").unwrap();
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (10, 45, 0));
        assert_eq!(parse_timestamp("E240615").unwrap().to_rfc3339(), "2024-06-15T00:00:00+01:00");

        assert!(parse_timestamp("H2001").is_none());
        assert!(parse_timestamp("H201301000000").is_none());
        assert!(parse_timestamp("1200101083005").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_verbose_timestamp() {
        let ts = parse_timestamp("Jan 15 2024").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-15T00:00:00+01:00");
        assert!(parse_timestamp("Foo 15 2024").is_none());
    }

    #[test]
    fn test_integer_scaled() {
        let out = interpret(&frame(&[("EAST", "012345678"), ("SINSTS", "02200")]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].channel, "east");
        assert_eq!(out[0].group, "energy");
        match out[0].value {
            ChannelValue::Quantity { value, unit } => {
                assert!((value - 12345.678).abs() < 1e-9);
                assert_eq!(unit, "kWh");
            }
            _ => panic!("not a quantity"),
        }
        assert_eq!(out[1].value, ChannelValue::Quantity { value: 2200.0, unit: "VA" });
    }

    #[test]
    fn test_unknown_and_unparsable_fields_skipped() {
        let out = interpret(&frame(&[("FOO", "1"), ("SINSTS", "abc"), ("URMS1", ""), ("MOTDETAT", "000000"), ("URMS1", "231")]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, "urms1");
        assert_eq!(out[0].value, ChannelValue::Quantity { value: 231.0, unit: "V" });
    }

    #[test]
    fn test_negative_integer_rejected() {
        let field = fields::lookup("SINSTS").unwrap();
        assert!(matches!(decode_field(field, "-5"), Err(LinkyError::UnparsableField { .. })));
    }

    #[test]
    fn test_companion_timestamp() {
        let out = interpret(&frame(&[("SMAXSN", "H200101083005|05400")]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].channel, "smaxsn_date");
        assert!(matches!(out[0].value, ChannelValue::Timestamp(_)));
        assert_eq!(out[1].channel, "smaxsn");
        assert_eq!(out[1].value, ChannelValue::Quantity { value: 5400.0, unit: "VA" });

        /* A broken timestamp does not take the value down */
        let out = interpret(&frame(&[("SMAXSN", "X|05400")]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, "smaxsn");
    }

    #[test]
    fn test_date_group() {
        let out = interpret(&frame(&[("DATE", "H200101083005|")]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, "date");
        assert_eq!(out[0].value.to_payload(), "2020-01-01T08:30:05+01:00");
    }

    #[test]
    fn test_text_trimmed() {
        let out = interpret(&frame(&[("NGTF", "     TEMPO      "), ("MSG2", "  ")]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, ChannelValue::Text("TEMPO".to_string()));
    }

    #[test]
    fn test_status_register_expanded() {
        let out = interpret(&frame(&[("STGE", "003A4101")]));
        /* Raw register plus every sub-field */
        assert_eq!(out.len(), 19);
        assert_eq!(out[0].value, ChannelValue::Text("003A4101".to_string()));
        assert_eq!(out[1].channel, "contactor");
        assert!(out.iter().all(|m| m.group == "status"));

        /* Garbage keeps the raw text only */
        let out = interpret(&frame(&[("STGE", "XYZ")]));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_relays_expanded() {
        let out = interpret(&frame(&[("RELAIS", "001")]));
        assert_eq!(out.len(), 9);
        assert_eq!(out[1].channel, "relay1");
        assert_eq!(out[1].value, ChannelValue::Switch(true));
        assert_eq!(out[8].value, ChannelValue::Switch(false));
    }

    #[test]
    fn test_schedule_expanded() {
        let out = interpret(&frame(&[("PJOURF+1", "00004003 06004004 NONUTILE")]));
        let channels: Vec<&str> = out.iter().map(|m| m.channel.as_str()).collect();
        assert_eq!(
            channels,
            vec![
                "pjourf_next",
                "pjourf_next_1_time",
                "pjourf_next_1_tariff",
                "pjourf_next_1_relay",
                "pjourf_next_2_time",
                "pjourf_next_2_tariff",
                "pjourf_next_2_relay",
            ]
        );
        assert_eq!(out[2].value, ChannelValue::Text("Blanc-HC".to_string()));
    }
}
