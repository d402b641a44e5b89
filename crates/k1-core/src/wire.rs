//! K1 wire format — TLV framing, CRC32, and the chunked upload plan.
//!
//! A TLV is `[type: u8][length: u16 BE][value]`. Fields carried *inside*
//! upload values (BEGIN total length, DATA offset, END crc) are little-endian.
//! The envelope/body endianness split is what the device firmware expects;
//! do not "fix" it.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest payload the device will accept in one upload.
pub const PAYLOAD_MAX: usize = 262_144;

/// Default DATA chunk size. A device may advertise its own in STATUS.
pub const PUT_DATA_MAX: usize = 4_089;

/// Longest frame sequence a device will store or stream.
pub const MAX_SEQUENCE_FRAMES: usize = 273;

/// Bytes of TLV envelope before the value.
pub const TLV_HEADER_LEN: usize = 3;

/// Bytes of offset prefix inside each DATA value.
pub const DATA_OFFSET_LEN: usize = 4;

// ── Types ─────────────────────────────────────────────────────────────────────

/// TLV type tags. `Put*` frame uploads; the rest are the live session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    PutBegin = 0x01,
    PutData = 0x02,
    PutEnd = 0x03,
    Command = 0x20,
    List = 0x22,
    Status = 0x30,
    Error = 0xFF,
}

impl TryFrom<u8> for TlvType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(TlvType::PutBegin),
            0x02 => Ok(TlvType::PutData),
            0x03 => Ok(TlvType::PutEnd),
            0x20 => Ok(TlvType::Command),
            0x22 => Ok(TlvType::List),
            0x30 => Ok(TlvType::Status),
            0xFF => Ok(TlvType::Error),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl From<TlvType> for u8 {
    fn from(t: TlvType) -> u8 {
        t as u8
    }
}

/// On-wire TLV envelope header.
///
/// Wire size: 3 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C, packed)]
pub struct TlvHeader {
    pub kind: u8,
    /// Value length in bytes, big-endian.
    pub length: U16<BigEndian>,
}

assert_eq_size!(TlvHeader, [u8; 3]);

/// Prefix of every PUT_DATA value.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C, packed)]
pub struct DataPrefix {
    /// Byte offset of this chunk within the payload, little-endian.
    pub offset: U32<LittleEndian>,
}

assert_eq_size!(DataPrefix, [u8; 4]);

/// One type-length-value record. The type is kept as a raw byte so unknown
/// tags from the device survive decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u8,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(kind: TlvType, value: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Zero-length record, e.g. a STATUS or LIST query.
    pub fn empty(kind: TlvType) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn tlv_type(&self) -> Result<TlvType, WireError> {
        TlvType::try_from(self.kind)
    }

    /// Envelope plus value length.
    pub fn encoded_len(&self) -> usize {
        TLV_HEADER_LEN + self.value.len()
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }

    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), WireError> {
        let length = u16::try_from(self.value.len())
            .map_err(|_| WireError::ValueTooLong(self.value.len()))?;
        let header = TlvHeader {
            kind: self.kind,
            length: U16::new(length),
        };
        out.put_slice(header.as_bytes());
        out.put_slice(&self.value);
        Ok(())
    }

    /// Decode one TLV from the front of `buf`. Returns the record and the
    /// number of bytes consumed.
    pub fn decode_one(buf: &[u8]) -> Result<(Tlv, usize), WireError> {
        let header = TlvHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
            needed: TLV_HEADER_LEN,
            available: buf.len(),
        })?;
        let len = usize::from(header.length.get());
        let end = TLV_HEADER_LEN + len;
        let value = buf.get(TLV_HEADER_LEN..end).ok_or(WireError::Truncated {
            needed: end,
            available: buf.len(),
        })?;
        Ok((
            Tlv {
                kind: header.kind,
                value: Bytes::copy_from_slice(value),
            },
            end,
        ))
    }

    /// Decode back-to-back TLVs. Stops at the first truncated record and
    /// returns everything decoded before it alongside the error, if any.
    pub fn decode_all(mut buf: &[u8]) -> (Vec<Tlv>, Option<WireError>) {
        let mut out = Vec::new();
        while !buf.is_empty() {
            match Tlv::decode_one(buf) {
                Ok((tlv, used)) => {
                    out.push(tlv);
                    buf = &buf[used..];
                }
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }
}

// ── CRC32 ─────────────────────────────────────────────────────────────────────

/// CRC-32/ISO-HDLC: reflected poly 0xEDB88320, init and xorout 0xFFFFFFFF.
pub fn crc32(buf: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in buf {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    crc ^ 0xFFFF_FFFF
}

// ── Put plan ──────────────────────────────────────────────────────────────────

/// BEGIN, DATA*, END — one chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPlan {
    pub tlvs: Vec<Tlv>,
    /// Sum of every TLV's encoded length.
    pub total_bytes: usize,
    pub crc: u32,
    pub chunk_max: usize,
}

/// Split `payload` into an upload plan with DATA chunks of at most `chunk_max`.
pub fn make_put_plan(payload: &[u8], chunk_max: usize) -> Result<PutPlan, WireError> {
    if payload.len() > PAYLOAD_MAX {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    if chunk_max == 0 || chunk_max + DATA_OFFSET_LEN > usize::from(u16::MAX) {
        return Err(WireError::InvalidChunkSize(chunk_max));
    }

    let mut tlvs = Vec::with_capacity(payload.len().div_ceil(chunk_max) + 2);
    tlvs.push(Tlv::new(
        TlvType::PutBegin,
        Bytes::copy_from_slice(&(payload.len() as u32).to_le_bytes()),
    ));

    let mut offset = 0usize;
    for chunk in payload.chunks(chunk_max) {
        let prefix = DataPrefix {
            offset: U32::new(offset as u32),
        };
        let mut value = BytesMut::with_capacity(DATA_OFFSET_LEN + chunk.len());
        value.put_slice(prefix.as_bytes());
        value.put_slice(chunk);
        tlvs.push(Tlv::new(TlvType::PutData, value.freeze()));
        offset += chunk.len();
    }

    let crc = crc32(payload);
    tlvs.push(Tlv::new(
        TlvType::PutEnd,
        Bytes::copy_from_slice(&crc.to_le_bytes()),
    ));

    let total_bytes = tlvs.iter().map(Tlv::encoded_len).sum();
    Ok(PutPlan {
        tlvs,
        total_bytes,
        crc,
        chunk_max,
    })
}

impl PutPlan {
    pub fn data_frames(&self) -> impl Iterator<Item = &Tlv> {
        self.tlvs
            .iter()
            .filter(|t| t.kind == u8::from(TlvType::PutData))
    }

    /// Every TLV encoded back to back.
    pub fn serialize(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::with_capacity(self.total_bytes);
        for tlv in &self.tlvs {
            tlv.encode_into(&mut out)?;
        }
        Ok(out.freeze())
    }

    /// One-line human summary, for dry runs.
    pub fn dry_run_report(&self) -> String {
        format!(
            "TLV plan: totalBytes={} | PUT_DATA chunks={} (≤{}) | CRC32=0x{:08x}",
            self.total_bytes,
            self.data_frames().count(),
            self.chunk_max,
            self.crc
        )
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when building or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload of {0} bytes exceeds device limit {}", PAYLOAD_MAX)]
    PayloadTooLarge(usize),

    #[error("chunk size {0} does not fit a PUT_DATA frame")]
    InvalidChunkSize(usize),

    #[error("TLV value of {0} bytes does not fit a u16 length")]
    ValueTooLong(usize),

    #[error("truncated TLV: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown TLV type: 0x{0:02x}")]
    UnknownType(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
