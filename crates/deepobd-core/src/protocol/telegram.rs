//! BMW-FAST telegram encoding/decoding
//!
//! Telegram format:
//! - 1 byte: format (bits 7..6) and inline length (bits 5..0, zero if not inline)
//! - 1 byte: target address
//! - 1 byte: source address
//! - 1 byte: extended length, only present when the inline length is zero
//! - 2 bytes: 16-bit length (big-endian), only present when the extended length is zero
//! - N bytes: payload
//! - 1 byte: checksum over everything before it

use byteorder::{BigEndian, ByteOrder};

use super::checksum;
use super::ProtocolError;

/// Format bits used for physically addressed telegrams
pub const FORMAT_PHYSICAL: u8 = 0x80;

/// Largest payload the inline length field can carry
pub const MAX_INLINE_LENGTH: usize = 0x3F;

/// Largest payload any header form can carry
pub const MAX_PAYLOAD_LENGTH: usize = 0xFFFF;

/// Position of the payload inside a raw telegram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelegramHeader {
    /// Format bits of the first byte
    pub format: u8,
    /// Target address
    pub target: u8,
    /// Source address
    pub source: u8,
    /// Offset of the first payload byte
    pub data_offset: usize,
    /// Payload length
    pub data_len: usize,
}

impl TelegramHeader {
    /// Decode the header of a raw telegram and check that the payload is present.
    ///
    /// The trailing checksum is not required here; the pending request
    /// buffer hands telegrams over with or without it.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::InvalidFrame(format!(
                "telegram too short: {} bytes",
                data.len()
            )));
        }

        let format = data[0] & 0xC0;
        let inline_len = (data[0] & 0x3F) as usize;
        let (data_offset, data_len) = if inline_len != 0 {
            (3, inline_len)
        } else if data[3] != 0 {
            (4, data[3] as usize)
        } else {
            if data.len() < 6 {
                return Err(ProtocolError::InvalidFrame(
                    "missing 16-bit length field".to_string(),
                ));
            }
            (6, BigEndian::read_u16(&data[4..6]) as usize)
        };

        if data.len() < data_offset + data_len {
            return Err(ProtocolError::InvalidFrame(format!(
                "telegram announces {} payload bytes, only {} present",
                data_len,
                data.len().saturating_sub(data_offset)
            )));
        }

        Ok(Self {
            format,
            target: data[1],
            source: data[2],
            data_offset,
            data_len,
        })
    }

    /// Total size including the checksum
    pub fn total_len(&self) -> usize {
        self.data_offset + self.data_len + 1
    }
}

/// An addressed BMW-FAST telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Format bits (normally [`FORMAT_PHYSICAL`])
    pub format: u8,
    /// Target address
    pub target: u8,
    /// Source address
    pub source: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Telegram {
    /// Create a physically addressed telegram
    pub fn new(target: u8, source: u8, payload: Vec<u8>) -> Self {
        Self {
            format: FORMAT_PHYSICAL,
            target,
            source,
            payload,
        }
    }

    /// Decode a complete telegram and verify its checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = TelegramHeader::parse(data)?;
        let end = header.data_offset + header.data_len;
        if data.len() <= end {
            return Err(ProtocolError::InvalidFrame("missing checksum".to_string()));
        }

        let expected = checksum::checksum(&data[..end]);
        let actual = data[end];
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            format: header.format,
            target: header.target,
            source: header.source,
            payload: data[header.data_offset..end].to_vec(),
        })
    }

    /// Decode the addressing and payload of a request, ignoring any checksum
    pub fn from_request(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = TelegramHeader::parse(data)?;
        Ok(Self {
            format: header.format,
            target: header.target,
            source: header.source,
            payload: data[header.data_offset..header.data_offset + header.data_len].to_vec(),
        })
    }

    /// Encode the telegram with the shortest header form, checksum appended
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.payload.len().min(MAX_PAYLOAD_LENGTH);
        let mut bytes = Vec::with_capacity(self.encoded_size());

        if len > 0 && len <= MAX_INLINE_LENGTH {
            bytes.push(self.format | len as u8);
            bytes.push(self.target);
            bytes.push(self.source);
        } else if len > 0 && len <= 0xFF {
            bytes.push(self.format);
            bytes.push(self.target);
            bytes.push(self.source);
            bytes.push(len as u8);
        } else {
            // a zero length byte announces the 16-bit length field
            bytes.push(self.format);
            bytes.push(self.target);
            bytes.push(self.source);
            bytes.push(0x00);
            let mut len_bytes = [0u8; 2];
            BigEndian::write_u16(&mut len_bytes, len as u16);
            bytes.extend_from_slice(&len_bytes);
        }

        bytes.extend_from_slice(&self.payload[..len]);
        checksum::append(&mut bytes);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        let len = self.payload.len();
        let header = if len > 0 && len <= MAX_INLINE_LENGTH {
            3
        } else if len > 0 && len <= 0xFF {
            4
        } else {
            6
        };
        header + len + 1
    }
}

/// Builder for constructing telegrams
pub struct TelegramBuilder {
    target: u8,
    source: u8,
    payload: Vec<u8>,
}

impl TelegramBuilder {
    /// Start a telegram from `source` to `target`
    pub fn new(target: u8, source: u8) -> Self {
        Self {
            target,
            source,
            payload: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the telegram
    pub fn build(self) -> Telegram {
        Telegram::new(self.target, self.source, self.payload)
    }
}
