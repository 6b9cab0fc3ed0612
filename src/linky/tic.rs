use super::LinkyError;
use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;
use serde::{Deserialize, Serialize};

/* Framing bytes as sent by the meter */
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
const LF: u8 = 0x0A;
const CR: u8 = 0x0D;

/* A standard frame of a three phase meter stays well below this */
const MAX_FRAME_LEN: usize = 4096;

lazy_static! {
    /* Over-current alarm groups, the only ones the meters are known to garble */
    static ref REPAIRABLE_GROUP: Regex = Regex::new(r"^(ADPS|ADIR[1-3])(.?)(\d{3})$").unwrap();
}

/// Link dialect of the TIC output, configured per link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TicMode {
    /// "historique", 1200 baud
    Legacy,
    /// "standard", 9600 baud
    Extended,
}

impl TicMode {
    pub fn separator(&self) -> u8 {
        match self {
            TicMode::Legacy => b' ',
            TicMode::Extended => b'\t',
        }
    }

    pub fn default_baud_rate(&self) -> u32 {
        match self {
            TicMode::Legacy => 1200,
            TicMode::Extended => 9600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicOptions {
    pub mode: TicMode,
    pub verify_checksum: bool,
    pub auto_repair: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicGroup {
    pub label: String,
    pub value: String,
    pub timestamp: Option<String>,
    pub checksum: u8,
}

impl TicGroup {
    /// The value as handed to the interpreter, timestamped groups use `<timestamp>|<value>`
    pub fn field_value(&self) -> String {
        match &self.timestamp {
            Some(ts) => format!("{}|{}", ts, self.value),
            None => self.value.clone(),
        }
    }
}

/// A fully validated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicFrame {
    pub groups: Vec<TicGroup>,
}

impl TicFrame {
    pub fn get(&self, label: &str) -> Option<&TicGroup> {
        self.groups.iter().find(|g| g.label == label)
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        self.groups.iter().map(|g| (g.label.clone(), g.field_value())).collect()
    }
}

/// Checksum of a group: sum of the covered bytes, masked to 6 bits, shifted into the printable range
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
    ((sum & 0x3F) as u8) + 0x20
}

/// Bytes covered by the checksum, `line` being label up to the checksum character included
fn checksum_range(mode: TicMode, line: &[u8]) -> &[u8] {
    match mode {
        /* The separator in front of the checksum is not part of it in legacy mode */
        TicMode::Legacy => &line[..line.len() - 2],
        TicMode::Extended => &line[..line.len() - 1],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingStart,
    InFrame,
}

/// Stateful decoder turning the raw character stream of one link into frames
pub struct TicDecoder {
    options: TicOptions,
    state: State,
    in_group: bool,
    group: Vec<u8>,
    groups: Vec<TicGroup>,
    frame_len: usize,
}

impl TicDecoder {
    pub fn new(options: TicOptions) -> Self {
        return TicDecoder {
            options,
            state: State::WaitingStart,
            in_group: false,
            group: Vec::new(),
            groups: Vec::new(),
            frame_len: 0,
        }
    }

    /// True while bytes of a started frame are buffered
    pub fn in_frame(&self) -> bool {
        self.state == State::InFrame
    }

    /// Drops a partial frame, the next frame starts at the next STX
    pub fn reset(&mut self) {
        self.state = State::WaitingStart;
        self.in_group = false;
        self.group.clear();
        self.groups.clear();
        self.frame_len = 0;
    }

    fn start_frame(&mut self) {
        self.reset();
        self.state = State::InFrame;
    }

    fn fail(&mut self, error: LinkyError) -> Option<Result<TicFrame, LinkyError>> {
        debug!("Dropping partial frame: {error}");
        self.reset();
        Some(Err(error))
    }

    /// Feeds a chunk and returns every frame or error completed by it
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<TicFrame, LinkyError>> {
        data.iter().filter_map(|b| self.push(*b)).collect()
    }

    pub fn push(&mut self, byte: u8) -> Option<Result<TicFrame, LinkyError>> {
        if self.state == State::WaitingStart {
            if byte == STX {
                trace!("Start of frame found");
                self.start_frame();
            }
            return None;
        }

        match byte {
            STX => {
                self.start_frame();
                Some(Err(LinkyError::MalformedFrame("start of frame inside a frame".to_string())))
            }
            EOT => self.fail(LinkyError::MalformedFrame("frame interrupted by the meter".to_string())),
            ETX => {
                if !self.group.is_empty() {
                    return self.fail(LinkyError::MalformedFrame("group not terminated".to_string()));
                }
                let groups = std::mem::take(&mut self.groups);
                self.reset();
                if groups.is_empty() {
                    return Some(Err(LinkyError::MalformedFrame("frame without groups".to_string())));
                }
                Some(Ok(TicFrame { groups }))
            }
            LF => {
                let finished = self.finish_group();
                self.in_group = true;
                finished
            }
            CR => {
                let finished = self.finish_group();
                self.in_group = false;
                finished
            }
            b => {
                if !self.in_group {
                    return self.fail(LinkyError::MalformedFrame(format!("data outside a group: 0x{:02x}", b)));
                }
                self.frame_len += 1;
                if self.frame_len > MAX_FRAME_LEN {
                    return self.fail(LinkyError::MalformedFrame("frame too long".to_string()));
                }
                self.group.push(b);
                None
            }
        }
    }

    fn finish_group(&mut self) -> Option<Result<TicFrame, LinkyError>> {
        if self.group.is_empty() {
            return None;
        }

        let line = std::mem::take(&mut self.group);
        match self.decode_group(&line) {
            Ok(group) => {
                trace!("Group {} = {:?}", group.label, group.value);
                self.groups.push(group);
                None
            }
            Err(e) => self.fail(e),
        }
    }

    fn decode_group(&self, line: &[u8]) -> Result<TicGroup, LinkyError> {
        match parse_group(&self.options, line) {
            Ok(group) => Ok(group),
            Err(e) if self.options.auto_repair && is_repairable(line) => {
                match repair_group(&self.options, line) {
                    Some(group) => {
                        debug!("Repaired over-current group {:?} to value {}", String::from_utf8_lossy(line), group.value);
                        Ok(group)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn is_repairable(line: &[u8]) -> bool {
    line.starts_with(b"ADPS") || line.starts_with(b"ADIR")
}

/// Parses one group, `line` being the bytes between LF and CR
pub fn parse_group(options: &TicOptions, line: &[u8]) -> Result<TicGroup, LinkyError> {
    let sep = options.mode.separator();
    if line.len() < 4 {
        return Err(LinkyError::MalformedFrame(format!("group too short: {:?}", String::from_utf8_lossy(line))));
    }

    let received = line[line.len() - 1];
    if line[line.len() - 2] != sep {
        return Err(LinkyError::MalformedFrame(format!("missing separator before checksum in {:?}", String::from_utf8_lossy(line))));
    }

    let body = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| LinkyError::MalformedFrame("group is not ASCII".to_string()))?;

    let (label, timestamp, value) = match options.mode {
        TicMode::Legacy => match body.split_once(' ') {
            Some((label, value)) => (label, None, value),
            None => return Err(LinkyError::MalformedFrame(format!("missing separator in {:?}", body))),
        },
        TicMode::Extended => {
            let parts: Vec<&str> = body.split('\t').collect();
            match parts.as_slice() {
                [label, value] => (*label, None, *value),
                [label, ts, value] => (*label, Some(ts.to_string()), *value),
                _ => return Err(LinkyError::MalformedFrame(format!("unexpected number of separators in {:?}", body))),
            }
        }
    };

    if label.is_empty() {
        return Err(LinkyError::MalformedFrame(format!("empty label in {:?}", body)));
    }

    if options.verify_checksum {
        let expected = checksum(checksum_range(options.mode, line));
        if expected != received {
            return Err(LinkyError::ChecksumMismatch {
                label: label.to_string(),
                expected: expected as char,
                received: received as char,
            });
        }
    }

    Ok(TicGroup {
        label: label.to_string(),
        value: value.to_string(),
        timestamp,
        checksum: received,
    })
}

/// Tries the known corruption shapes of an over-current group
fn repair_group(options: &TicOptions, line: &[u8]) -> Option<TicGroup> {
    let sep = options.mode.separator();
    if line.len() < 3 || line[line.len() - 2] != sep {
        return None;
    }

    let received = line[line.len() - 1];
    let body = String::from_utf8_lossy(&line[..line.len() - 2]);
    let caps = REPAIRABLE_GROUP.captures(&body)?;
    let label = caps.get(1)?.as_str();
    let value = caps.get(3)?.as_str();

    /* `label SEP value SEP checksum` is the only accepted reconstruction */
    let mut rebuilt = Vec::with_capacity(label.len() + value.len() + 3);
    rebuilt.extend_from_slice(label.as_bytes());
    rebuilt.push(sep);
    rebuilt.extend_from_slice(value.as_bytes());
    rebuilt.push(sep);
    rebuilt.push(received);

    if options.verify_checksum && checksum(checksum_range(options.mode, &rebuilt)) != received {
        return None;
    }

    Some(TicGroup {
        label: label.to_string(),
        value: value.to_string(),
        timestamp: None,
        checksum: received,
    })
}

/// Builds a group with a correct checksum, as a meter would send it
#[cfg(test)]
pub(crate) fn encode_group(mode: TicMode, label: &str, timestamp: Option<&str>, value: &str) -> Vec<u8> {
    let sep = mode.separator();
    let mut line = Vec::new();
    line.extend_from_slice(label.as_bytes());
    line.push(sep);
    if let Some(ts) = timestamp {
        line.extend_from_slice(ts.as_bytes());
        line.push(sep);
    }
    line.extend_from_slice(value.as_bytes());
    line.push(sep);
    let chk = match mode {
        TicMode::Legacy => checksum(&line[..line.len() - 1]),
        TicMode::Extended => checksum(&line),
    };
    line.push(chk);
    line
}

#[cfg(test)]
pub(crate) fn encode_frame(groups: &[Vec<u8>]) -> Vec<u8> {
    let mut frame = vec![STX];
    for group in groups {
        frame.push(LF);
        frame.extend_from_slice(group);
        frame.push(CR);
    }
    frame.push(ETX);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(mode: TicMode, auto_repair: bool) -> TicOptions {
        TicOptions { mode, verify_checksum: true, auto_repair }
    }

    fn decode(options: TicOptions, data: &[u8]) -> Vec<Result<TicFrame, LinkyError>> {
        TicDecoder::new(options).feed(data)
    }

    /* A group as sent by the meter when it forgets the separator behind the label */
    fn garbled_adps(mode: TicMode, value: &str) -> Vec<u8> {
        let good = encode_group(mode, "ADPS", None, value);
        let mut bad = good.clone();
        bad.remove(4);
        bad
    }

    #[test]
    fn test_checksum_known_groups() {
        /* Reference groups taken from a legacy meter */
        assert_eq!(checksum(b"ADCO 031428097115"), b'@');
        assert_eq!(checksum(b"PAPP 01000"), b'"');
        assert_eq!(checksum(b"IINST 005"), b'\\');
    }

    #[test]
    fn test_valid_groups_accepted() {
        for mode in [TicMode::Legacy, TicMode::Extended] {
            for (label, value) in [("ADCO", "031428097115"), ("PAPP", "01000"), ("SINSTS", "02200"), ("NGTF", "      TEMPO      ")] {
                let line = encode_group(mode, label, None, value);
                let group = parse_group(&options(mode, false), &line).unwrap();
                assert_eq!(group.label, label);
                assert_eq!(group.value, value);
            }
        }
    }

    #[test]
    fn test_flipped_checksum_bit_rejected() {
        for mode in [TicMode::Legacy, TicMode::Extended] {
            let line = encode_group(mode, "PAPP", None, "01000");
            for bit in 0..8 {
                let mut bad = line.clone();
                let last = bad.len() - 1;
                bad[last] ^= 1 << bit;
                let result = parse_group(&options(mode, true), &bad);
                assert!(result.is_err(), "bit {bit} flip accepted in {mode:?}");
            }
        }
    }

    #[test]
    fn test_checksum_verification_optional() {
        let mut line = encode_group(TicMode::Extended, "SINSTS", None, "02200");
        let last = line.len() - 1;
        line[last] ^= 0x01;
        let lax = TicOptions { mode: TicMode::Extended, verify_checksum: false, auto_repair: false };
        assert_eq!(parse_group(&lax, &line).unwrap().value, "02200");
        assert!(matches!(
            parse_group(&options(TicMode::Extended, false), &line),
            Err(LinkyError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_extended_group_with_timestamp() {
        let line = encode_group(TicMode::Extended, "SMAXSN", Some("E200101080000"), "10000");
        let group = parse_group(&options(TicMode::Extended, false), &line).unwrap();
        assert_eq!(group.label, "SMAXSN");
        assert_eq!(group.timestamp.as_deref(), Some("E200101080000"));
        assert_eq!(group.value, "10000");
        assert_eq!(group.field_value(), "E200101080000|10000");
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        let line = b"PAPP01000 !".to_vec();
        assert!(matches!(
            parse_group(&options(TicMode::Legacy, true), &line),
            Err(LinkyError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_full_legacy_frame() {
        let frame = encode_frame(&[
            encode_group(TicMode::Legacy, "ADCO", None, "031428097115"),
            encode_group(TicMode::Legacy, "OPTARIF", None, "BASE"),
            encode_group(TicMode::Legacy, "PAPP", None, "01000"),
        ]);
        let results = decode(options(TicMode::Legacy, false), &frame);
        assert_eq!(results.len(), 1);
        let frame = results[0].clone().unwrap();
        assert_eq!(frame.groups.len(), 3);
        assert_eq!(frame.get("OPTARIF").unwrap().value, "BASE");
    }

    #[test]
    fn test_resync_after_garbage_and_bad_frame() {
        let good = encode_frame(&[encode_group(TicMode::Extended, "SINSTS", None, "02200")]);
        let mut bad_group = encode_group(TicMode::Extended, "URMS1", None, "230");
        let last = bad_group.len() - 1;
        bad_group[last] ^= 0x02;
        let bad = encode_frame(&[bad_group, encode_group(TicMode::Extended, "IRMS1", None, "010")]);

        let mut stream = b"\x0aSTALE\x09bytes\x0d".to_vec();
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&good);

        let results = decode(options(TicMode::Extended, true), &stream);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(LinkyError::ChecksumMismatch { .. })));
        let frame = results[1].clone().unwrap();
        assert_eq!(frame.groups.len(), 1);
        assert_eq!(frame.groups[0].label, "SINSTS");
    }

    #[test]
    fn test_frame_split_over_chunks() {
        let frame = encode_frame(&[
            encode_group(TicMode::Extended, "ADSC", None, "041876097474"),
            encode_group(TicMode::Extended, "URMS1", None, "231"),
        ]);
        let mut decoder = TicDecoder::new(options(TicMode::Extended, false));
        let (a, b) = frame.split_at(7);
        assert!(decoder.feed(a).is_empty());
        assert!(decoder.in_frame());
        let results = decoder.feed(b);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_start_inside_frame_and_interrupt() {
        let group = encode_group(TicMode::Legacy, "PAPP", None, "01000");
        let mut stream = vec![STX, LF];
        stream.extend_from_slice(&group);
        stream.push(CR);
        stream.extend_from_slice(&encode_frame(&[group.clone()]));
        stream.extend_from_slice(&[STX, LF]);
        stream.extend_from_slice(&group);
        stream.push(EOT);

        let results = decode(options(TicMode::Legacy, false), &stream);
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(LinkyError::MalformedFrame(_))));
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(LinkyError::MalformedFrame(_))));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let results = decode(options(TicMode::Legacy, false), &[STX, ETX]);
        assert!(matches!(results[0], Err(LinkyError::MalformedFrame(_))));
    }

    #[test]
    fn test_adps_repair() {
        for mode in [TicMode::Legacy, TicMode::Extended] {
            let bad = garbled_adps(mode, "030");
            assert!(parse_group(&options(mode, false), &bad).is_err());

            let decoder = TicDecoder::new(options(mode, true));
            let group = decoder.decode_group(&bad).unwrap();
            assert_eq!(group.label, "ADPS");
            assert_eq!(group.value, "030");
        }
    }

    #[test]
    fn test_adps_repair_with_stray_byte() {
        let good = encode_group(TicMode::Legacy, "ADIR2", None, "045");
        let mut bad = good.clone();
        bad[5] = b'#';
        let decoder = TicDecoder::new(options(TicMode::Legacy, true));
        let group = decoder.decode_group(&bad).unwrap();
        assert_eq!(group.label, "ADIR2");
        assert_eq!(group.value, "045");
    }

    #[test]
    fn test_adps_repair_idempotent_on_valid_group() {
        let good = encode_group(TicMode::Legacy, "ADPS", None, "042");
        let decoder = TicDecoder::new(options(TicMode::Legacy, true));
        let group = decoder.decode_group(&good).unwrap();
        assert_eq!(group.value, "042");
        assert_eq!(group, parse_group(&options(TicMode::Legacy, false), &good).unwrap());
    }

    #[test]
    fn test_repair_rejects_wrong_checksum_and_other_groups() {
        let mut bad = garbled_adps(TicMode::Legacy, "030");
        let last = bad.len() - 1;
        bad[last] ^= 0x04;
        let decoder = TicDecoder::new(options(TicMode::Legacy, true));
        assert!(decoder.decode_group(&bad).is_err());

        let mut papp = encode_group(TicMode::Legacy, "PAPP", None, "01000");
        papp.remove(4);
        assert!(decoder.decode_group(&papp).is_err());
    }

    #[test]
    fn test_extended_frame_with_garbled_adps() {
        let frame = encode_frame(&[
            encode_group(TicMode::Extended, "SINSTS", None, "02200"),
            garbled_adps(TicMode::Extended, "031"),
        ]);

        let repaired = decode(options(TicMode::Extended, true), &frame);
        assert_eq!(repaired.len(), 1);
        let frame_ok = repaired[0].clone().unwrap();
        assert_eq!(frame_ok.get("ADPS").unwrap().value, "031");
        assert_eq!(frame_ok.get("SINSTS").unwrap().value, "02200");

        let strict = decode(options(TicMode::Extended, false), &frame);
        assert_eq!(strict.len(), 1);
        assert!(strict[0].is_err());
    }
}
