//! Device reply parsing.
//!
//! Everything here is best-effort: short or malformed replies produce a
//! partial result, never an error. The session decides what to do with it.

use std::fmt;

use bytes::Buf;
use serde_json::Value;

use k1_core::{Tlv, TlvType};

use crate::transport::Inbound;

// ── Codes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AckCode {
    Ok,
    Busy,
    CrcMismatch,
    CrcBad,
    Timeout,
    InvalidFrame,
    SizeExceeded,
    StorageFull,
    NotFound,
    /// Reply arrived but could not be interpreted.
    Malformed,
    /// No connection to send on.
    Disconnected,
    Other(String),
}

impl AckCode {
    /// Codes worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AckCode::Busy | AckCode::CrcMismatch | AckCode::CrcBad | AckCode::Timeout
        )
    }

    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "OK" => AckCode::Ok,
            "BUSY" => AckCode::Busy,
            "CRC_MISMATCH" => AckCode::CrcMismatch,
            "CRC_BAD" => AckCode::CrcBad,
            "TIMEOUT" => AckCode::Timeout,
            "INVALID_FRAME" => AckCode::InvalidFrame,
            "SIZE_EXCEEDED" => AckCode::SizeExceeded,
            "STORAGE_FULL" => AckCode::StorageFull,
            "NOT_FOUND" => AckCode::NotFound,
            "MALFORMED" => AckCode::Malformed,
            "DISCONNECTED" => AckCode::Disconnected,
            other => AckCode::Other(other.to_string()),
        }
    }

    /// Error-frame code byte.
    pub fn from_error_byte(code: u8) -> Self {
        match code {
            0x01 => AckCode::InvalidFrame,
            0x02 => AckCode::CrcMismatch,
            0x03 => AckCode::SizeExceeded,
            0x04 => AckCode::StorageFull,
            0x05 => AckCode::NotFound,
            other => AckCode::Other(format!("ERR_0x{other:02X}")),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AckCode::Ok => "OK",
            AckCode::Busy => "BUSY",
            AckCode::CrcMismatch => "CRC_MISMATCH",
            AckCode::CrcBad => "CRC_BAD",
            AckCode::Timeout => "TIMEOUT",
            AckCode::InvalidFrame => "INVALID_FRAME",
            AckCode::SizeExceeded => "SIZE_EXCEEDED",
            AckCode::StorageFull => "STORAGE_FULL",
            AckCode::NotFound => "NOT_FOUND",
            AckCode::Malformed => "MALFORMED",
            AckCode::Disconnected => "DISCONNECTED",
            AckCode::Other(s) => s,
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Status / inventory ────────────────────────────────────────────────────────

/// Device telemetry from a STATUS reply. Every field is optional; older
/// firmware sends a prefix of the full record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub version: Option<String>,
    pub led_count: Option<u16>,
    pub storage_available: Option<u32>,
    pub max_chunk: Option<u16>,
}

impl DeviceStatus {
    /// `[u32 LE version_len][version][u16 LE leds][u32 LE storage][u16 LE max_chunk]`
    pub fn parse(payload: &[u8]) -> Self {
        let mut status = DeviceStatus::default();
        let mut buf = payload;

        if buf.remaining() < 4 {
            return status;
        }
        let version_len = buf.get_u32_le() as usize;
        if version_len > 0 {
            let take = version_len.min(buf.remaining());
            status.version = Some(String::from_utf8_lossy(&buf[..take]).into_owned());
            buf.advance(take);
        }

        if buf.remaining() < 2 {
            return status;
        }
        status.led_count = Some(buf.get_u16_le());

        if buf.remaining() < 4 {
            return status;
        }
        status.storage_available = Some(buf.get_u32_le());

        if buf.remaining() < 2 {
            return status;
        }
        status.max_chunk = Some(buf.get_u16_le());
        status
    }
}

/// One stored pattern on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEntry {
    pub name: String,
    pub size: u32,
    pub mtime: u32,
}

/// `[u16 BE count]` then per entry `[u16 BE name_len][name][u32 LE size][u32 LE mtime]`.
/// Stops at the first truncated entry.
pub fn parse_inventory(payload: &[u8]) -> Vec<PatternEntry> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return Vec::new();
    }
    let count = usize::from(buf.get_u16());
    let mut entries = Vec::with_capacity(count.min(256));

    for _ in 0..count {
        if buf.remaining() < 2 {
            break;
        }
        let name_len = usize::from(buf.get_u16());
        if buf.remaining() < name_len + 8 {
            break;
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf.advance(name_len);
        let size = buf.get_u32_le();
        let mtime = buf.get_u32_le();
        entries.push(PatternEntry { name, size, mtime });
    }

    if entries.len() < count {
        tracing::debug!(expected = count, parsed = entries.len(), "inventory reply truncated");
    }
    entries
}

// ── ACK replies ───────────────────────────────────────────────────────────────

/// What the device said about one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReply {
    pub code: AckCode,
    pub message: Option<String>,
    pub bytes: Option<u64>,
    pub crc_ok: Option<bool>,
    pub seq: Option<u64>,
    pub status: Option<DeviceStatus>,
}

impl AckReply {
    pub fn with_code(code: AckCode) -> Self {
        Self {
            code,
            message: None,
            bytes: None,
            crc_ok: None,
            seq: None,
            status: None,
        }
    }

    pub fn timeout() -> Self {
        Self::with_code(AckCode::Timeout)
    }

    pub fn disconnected() -> Self {
        Self::with_code(AckCode::Disconnected)
    }

    pub fn is_ok(&self) -> bool {
        self.code == AckCode::Ok
    }

    pub fn parse(msg: &Inbound) -> Self {
        match msg {
            Inbound::Text(text) => Self::parse_text(text),
            Inbound::Binary(bytes) => Self::parse_binary(bytes),
        }
    }

    /// JSON first, then `OK CODE=… BYTES=… CRC=OK SEQ=…` tokens.
    pub fn parse_text(text: &str) -> Self {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
            return Self::from_json(&obj);
        }

        let mut reply = Self::with_code(AckCode::Malformed);
        let mut saw_ok = false;
        let mut code = None;
        for token in text
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty())
        {
            match token.split_once('=') {
                Some((key, value)) => match key.to_ascii_uppercase().as_str() {
                    "CODE" => code = Some(AckCode::from_token(value)),
                    "BYTES" => reply.bytes = value.parse().ok(),
                    "SEQ" => reply.seq = value.parse().ok(),
                    "CRC" => reply.crc_ok = Some(value.eq_ignore_ascii_case("OK")),
                    _ => {}
                },
                None => match AckCode::from_token(token) {
                    AckCode::Ok => saw_ok = true,
                    AckCode::Other(_) => {}
                    named => {
                        code.get_or_insert(named);
                    }
                },
            }
        }

        reply.code = match code {
            Some(code) => code,
            None if saw_ok => AckCode::Ok,
            None => AckCode::Other(text.trim().to_string()),
        };
        reply.message = Some(text.trim().to_string());
        reply
    }

    fn from_json(obj: &serde_json::Map<String, Value>) -> Self {
        let ok = obj.get("ok").and_then(Value::as_bool);
        let status = obj.get("status").and_then(Value::as_str);
        let code = obj.get("code").and_then(Value::as_str);

        let code = match (code, ok, status) {
            (Some(c), _, _) => AckCode::from_token(c),
            (None, Some(true), _) => AckCode::Ok,
            (None, _, Some(s)) => AckCode::from_token(s),
            (None, Some(false), None) => AckCode::Other("ERROR".to_string()),
            (None, None, None) => AckCode::Malformed,
        };

        let crc_ok = match obj.get("crc") {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => Some(s.eq_ignore_ascii_case("OK")),
            _ => None,
        };

        Self {
            code,
            message: obj
                .get("message")
                .or_else(|| obj.get("msg"))
                .and_then(Value::as_str)
                .map(str::to_string),
            bytes: obj.get("bytes").and_then(Value::as_u64),
            crc_ok,
            seq: obj.get("seq").and_then(Value::as_u64),
            status: None,
        }
    }

    /// First frame of a binary reply: 0xFF error, 0x30 status or upload-complete.
    pub fn parse_binary(bytes: &[u8]) -> Self {
        let (frames, _) = Tlv::decode_all(bytes);
        let Some(frame) = frames.first() else {
            return Self::with_code(AckCode::Malformed);
        };

        match frame.tlv_type() {
            Ok(TlvType::Error) => {
                let Some((&code, text)) = frame.value.split_first() else {
                    return Self::with_code(AckCode::Malformed);
                };
                let mut reply = Self::with_code(AckCode::from_error_byte(code));
                if !text.is_empty() {
                    reply.message = Some(String::from_utf8_lossy(text).into_owned());
                }
                reply
            }
            Ok(TlvType::Status) => {
                let mut reply = Self::with_code(AckCode::Ok);
                match upload_complete_name(&frame.value) {
                    Some(name) => reply.message = Some(name),
                    None => reply.status = Some(DeviceStatus::parse(&frame.value)),
                }
                reply
            }
            _ => {
                let mut reply = Self::with_code(AckCode::Malformed);
                reply.message = Some(format!("unexpected frame type 0x{:02x}", frame.kind));
                reply
            }
        }
    }
}

/// Short-form upload acknowledgement: `[name_len][name]` and nothing else.
fn upload_complete_name(payload: &[u8]) -> Option<String> {
    let (&len, name) = payload.split_first()?;
    (len > 0 && name.len() == usize::from(len)).then(|| String::from_utf8_lossy(name).into_owned())
}
