use super::LinkyError;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use log::debug;
use serde_json::Value;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Clear text header in front of every D2L packet
pub const HEADER_LEN: usize = 16;
/* Layout of the decrypted block in front of the text payload */
const INNER_HEADER_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
/* Fixed prefix of the application key material */
const KEY_PREFIX: &str = "7F";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D2lHeader {
    pub version: u8,
    /// Total length of the packet, header included
    pub length: u16,
    pub device_id: u64,
}

impl D2lHeader {
    pub fn parse(data: &[u8]) -> Result<Self, LinkyError> {
        if data.len() < HEADER_LEN {
            return Err(LinkyError::MalformedFrame(format!("D2L header truncated to {} bytes", data.len())));
        }

        let length = u16::from_le_bytes([data[2], data[3]]);
        if (length as usize) < HEADER_LEN {
            return Err(LinkyError::MalformedFrame(format!("D2L packet length {length} shorter than its header")));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&data[4..12]);

        Ok(D2lHeader {
            version: data[0],
            length,
            device_id: u64::from_le_bytes(id),
        })
    }
}

/// Key material of one dongle, built once from its configuration
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoContext {
    key: [u8; 16],
    iv: [u8; 16],
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoContext { .. }")
    }
}

fn to_block(data: &[u8], what: &str) -> Result<[u8; 16], LinkyError> {
    data.try_into()
        .map_err(|_| LinkyError::CryptoFailure(format!("{what} must be 16 bytes, got {}", data.len())))
}

/// The dongle key is the configured hex string with `7F` prepended, the prefix byte is dropped again
pub fn derive_key(app_key: &str) -> Result<[u8; 16], LinkyError> {
    let material = hex::decode(format!("{}{}", KEY_PREFIX, app_key.trim()))
        .map_err(|e| LinkyError::CryptoFailure(format!("application key is not hex: {e}")))?;
    to_block(&material[1..], "application key")
}

impl CryptoContext {
    pub fn from_hex(app_key: &str, iv_key: &str) -> Result<Self, LinkyError> {
        let key = derive_key(app_key)?;
        let iv = hex::decode(iv_key.trim())
            .map_err(|e| LinkyError::CryptoFailure(format!("IV key is not hex: {e}")))?;
        Ok(CryptoContext { key, iv: to_block(&iv, "IV key")? })
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, LinkyError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(LinkyError::CryptoFailure(format!("ciphertext length {} is not a multiple of the block size", ciphertext.len())));
        }

        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| LinkyError::CryptoFailure(e.to_string()))
    }

    #[cfg(test)]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        use aes::cipher::BlockEncryptMut;
        cbc::Encryptor::<aes::Aes128>::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<NoPadding>(plaintext)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    UpdateRequest,
    PushJson,
    ClockRequest,
    Unknown(u8),
}

impl From<u8> for PayloadType {
    fn from(value: u8) -> Self {
        match value & 0x7F {
            0x01 => PayloadType::UpdateRequest,
            0x03 => PayloadType::PushJson,
            0x05 => PayloadType::ClockRequest,
            other => PayloadType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPayload {
    /// Sent by the dongle, not verified
    pub crc: u16,
    pub payload_type: PayloadType,
    pub is_response: bool,
    pub next_query: u8,
    pub text: String,
}

pub fn parse_inner(plain: &[u8]) -> Result<InnerPayload, LinkyError> {
    if plain.len() < INNER_HEADER_LEN {
        return Err(LinkyError::CryptoFailure(format!("decrypted payload too short ({} bytes)", plain.len())));
    }

    let length = u16::from_le_bytes([plain[2], plain[3]]) as usize;
    let end = INNER_HEADER_LEN + length;
    if end > plain.len() {
        return Err(LinkyError::CryptoFailure(format!("inner length {length} exceeds the {} decrypted bytes", plain.len())));
    }

    /* Dongles pad the text up to the block size with zeros */
    if plain[end..].iter().any(|b| *b != 0) {
        return Err(LinkyError::CryptoFailure("padding after the payload is not zero".to_string()));
    }

    let text = std::str::from_utf8(&plain[INNER_HEADER_LEN..end])
        .map_err(|_| LinkyError::CryptoFailure("decrypted payload is not UTF-8".to_string()))?;

    Ok(InnerPayload {
        crc: u16::from_le_bytes([plain[0], plain[1]]),
        payload_type: PayloadType::from(plain[4]),
        is_response: plain[4] & 0x80 != 0,
        next_query: plain[5],
        text: text.to_string(),
    })
}

/// JSON object of the push message, kept in wire order, numbers are rendered as text
pub fn parse_push_payload(text: &str) -> Result<Vec<(String, String)>, LinkyError> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| LinkyError::CryptoFailure(format!("push payload is not JSON: {e}")))?;

    let map = match doc {
        Value::Object(map) => map,
        _ => return Err(LinkyError::CryptoFailure("push payload is not a JSON object".to_string())),
    };

    let mut fields = Vec::with_capacity(map.len());
    for (label, value) in map {
        let value = match value {
            Value::String(s) => s,
            Value::Null => continue,
            other => other.to_string(),
        };
        fields.push((label, value));
    }
    Ok(fields)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum D2lMessage {
    Push(Vec<(String, String)>),
    UpdateRequest,
    ClockRequest,
    Unknown(u8),
}

/// Decrypts and dispatches one complete packet
pub fn decode_packet(packet: &[u8], crypto: &CryptoContext) -> Result<D2lMessage, LinkyError> {
    let header = D2lHeader::parse(packet)?;
    let length = header.length as usize;
    if packet.len() < length {
        return Err(LinkyError::MalformedFrame(format!("D2L packet has {} of {} bytes", packet.len(), length)));
    }

    let plain = crypto.decrypt(&packet[HEADER_LEN..length])?;
    let inner = parse_inner(&plain)?;
    debug!("D2L {:016X}: type {:?}, response {}, next query {:#04X}, crc {:#06X}",
        header.device_id, inner.payload_type, inner.is_response, inner.next_query, inner.crc);

    Ok(match inner.payload_type {
        PayloadType::PushJson => D2lMessage::Push(parse_push_payload(&inner.text)?),
        PayloadType::UpdateRequest => D2lMessage::UpdateRequest,
        PayloadType::ClockRequest => D2lMessage::ClockRequest,
        PayloadType::Unknown(t) => D2lMessage::Unknown(t),
    })
}

/// Collects the bytes of one connection until complete packets are available
#[derive(Debug, Default)]
pub struct D2lAssembler {
    buffer: Vec<u8>,
}

impl D2lAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete packet, `None` while more bytes are needed
    pub fn next_packet(&mut self) -> Option<Result<Vec<u8>, LinkyError>> {
        if self.buffer.len() < 4 {
            return None;
        }

        let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length < HEADER_LEN {
            /* Nothing to resynchronise on, start over with the next read */
            self.buffer.clear();
            return Some(Err(LinkyError::MalformedFrame(format!("D2L packet length {length} shorter than its header"))));
        }

        if self.buffer.len() < length {
            return None;
        }

        Some(Ok(self.buffer.drain(..length).collect()))
    }
}

#[cfg(test)]
pub(crate) fn build_packet(device_id: u64, crypto: &CryptoContext, payload_type: u8, text: &str) -> Vec<u8> {
    let mut inner = vec![0u8; INNER_HEADER_LEN];
    inner[2..4].copy_from_slice(&(text.len() as u16).to_le_bytes());
    inner[4] = payload_type;
    inner.extend_from_slice(text.as_bytes());
    while inner.len() % BLOCK_LEN != 0 {
        inner.push(0);
    }

    let ciphertext = crypto.encrypt(&inner);
    let mut packet = vec![0u8; HEADER_LEN];
    packet[0] = 3;
    packet[2..4].copy_from_slice(&((HEADER_LEN + ciphertext.len()) as u16).to_le_bytes());
    packet[4..12].copy_from_slice(&device_id.to_le_bytes());
    packet.extend_from_slice(&ciphertext);
    packet
}
