//! Dedicated BMW-FAST adapter telegrams
//!
//! The adapter accepts three requests besides plain BMW-FAST traffic:
//!
//! - Identification: the fixed probe `82 F1 F1 FD FD 5E`, answered by the
//!   echoed probe and a 9-byte version response.
//! - Data: `00 00 BH BL F1 IB LH LL <data> CS`, a K-line transmission with
//!   explicit line settings.
//! - Pulse: `00 81 BH BL F1 BC WH WL <pattern> CS`, a bit-banged waveform
//!   used for slow/fast init.
//!
//! `BH BL` is half the baud rate, `F1` the flag byte, `IB` the inter-byte
//! time in ms, `BC` the number of pattern bits (LSB first) and `WH WL` the
//! pulse width in ms.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::checksum;
use super::link::LinkChannel;
use super::{ProtocolError, TimeoutError, TransportError, DEFAULT_BAUD_RATE};

/// Identification probe, checksum included
pub const IDENT_PROBE: [u8; 6] = [0x82, 0xF1, 0xF1, 0xFD, 0xFD, 0x5E];

/// Length of the version response following the echoed probe
pub const IDENT_RESPONSE_LEN: usize = 9;

/// Oldest adapter type that understands data and pulse telegrams
pub const MIN_TELEGRAM_ADAPTER_TYPE: u16 = 0x0002;

/// Longest bit pattern a pulse telegram carries
pub const MAX_PULSE_BITS: u8 = 64;

const TELEGRAM_DATA: u8 = 0x00;
const TELEGRAM_PULSE: u8 = 0x81;

pub const FLAG_PARITY_EVEN: u8 = 0x01;
pub const FLAG_PARITY_ODD: u8 = 0x02;
pub const FLAG_NO_ECHO: u8 = 0x04;
pub const FLAG_SET_DTR: u8 = 0x08;
pub const FLAG_SEVEN_BITS: u8 = 0x10;
pub const FLAG_FAST_INIT: u8 = 0x40;

/// ISO 14230 fast init: 25ms low, 25ms high
const FAST_INIT_PATTERN: u64 = 0b10;
const FAST_INIT_BITS: u8 = 2;
const FAST_INIT_WIDTH_US: u32 = 25_000;

/// Parity of the K-line UART
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Baud rate, word length and parity of the vehicle side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: SerialParity::None,
        }
    }
}

impl LineSettings {
    /// True for plain BMW-FAST (115200 8N1)
    pub fn is_bmw_fast(&self) -> bool {
        self.baud_rate == DEFAULT_BAUD_RATE
            && self.data_bits == 8
            && self.parity == SerialParity::None
    }
}

/// Result of a successful identification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterIdent {
    pub adapter_type: u16,
    pub adapter_version: u16,
}

/// Parse the bytes read back after sending [`IDENT_PROBE`]
pub fn parse_identification(response: &[u8]) -> Result<AdapterIdent, ProtocolError> {
    verify_probe_echo(response)?;
    let total = IDENT_PROBE.len() + IDENT_RESPONSE_LEN;
    if response.len() < total {
        return Err(ProtocolError::InvalidFrame(format!(
            "identification response has {} of {} bytes",
            response.len(),
            total
        )));
    }

    let version = &response[IDENT_PROBE.len()..total];
    let expected = checksum::checksum(&version[..IDENT_RESPONSE_LEN - 1]);
    let actual = version[IDENT_RESPONSE_LEN - 1];
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }

    Ok(AdapterIdent {
        adapter_type: BigEndian::read_u16(&version[4..6]),
        adapter_version: BigEndian::read_u16(&version[6..8]),
    })
}

fn verify_probe_echo(response: &[u8]) -> Result<(), ProtocolError> {
    for (offset, (&expected, &actual)) in IDENT_PROBE.iter().zip(response).enumerate() {
        if expected != actual {
            return Err(ProtocolError::EchoMismatch {
                offset,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// True if the pulse describes the fast-init waveform
pub fn is_fast_init(pattern: u64, bit_count: u8, pulse_width_us: u32) -> bool {
    pattern == FAST_INIT_PATTERN && bit_count == FAST_INIT_BITS && pulse_width_us == FAST_INIT_WIDTH_US
}

/// Adapter identity and the line settings last pushed to it
#[derive(Debug, Clone, Default)]
pub struct AdapterCodec {
    adapter_type: Option<u16>,
    adapter_version: Option<u16>,
    active: Option<LineSettings>,
    fast_init: bool,
}

impl AdapterCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until identified; 0 means the adapter only echoed the probe
    pub fn adapter_type(&self) -> Option<u16> {
        self.adapter_type
    }

    pub fn adapter_version(&self) -> Option<u16> {
        self.adapter_version
    }

    pub fn fast_init(&self) -> bool {
        self.fast_init
    }

    pub fn set_fast_init(&mut self, fast_init: bool) {
        self.fast_init = fast_init;
    }

    /// The adapter must be told about new settings before the next read
    pub fn settings_update_required(&self, current: &LineSettings) -> bool {
        current.baud_rate != DEFAULT_BAUD_RATE && self.active.as_ref() != Some(current)
    }

    /// Remember `current` as pushed to the adapter
    pub fn update_active_settings(&mut self, current: &LineSettings) {
        self.active = Some(*current);
    }

    /// Identify the adapter unless already done (or `force`).
    ///
    /// An adapter that echoes the probe without answering is recorded as
    /// type 0 and the call still fails.
    pub fn update_info(
        &mut self,
        link: &mut LinkChannel,
        force: bool,
        inactivity: Duration,
    ) -> Result<(), TransportError> {
        if !force && self.adapter_type.is_some() {
            return Ok(());
        }
        self.adapter_type = None;
        self.adapter_version = None;

        link.flush_input()?;
        link.write(&IDENT_PROBE)?;

        let total = IDENT_PROBE.len() + IDENT_RESPONSE_LEN;
        let mut response = Vec::with_capacity(total);
        let mut last_byte = Instant::now();
        while response.len() < total {
            let elapsed = last_byte.elapsed();
            if elapsed >= inactivity {
                trace!("Ident response: {}", hex::encode_upper(&response));
                if response.len() >= IDENT_PROBE.len() && verify_probe_echo(&response).is_ok() {
                    debug!("Adapter echoed the probe only, assuming generic adapter");
                    self.adapter_type = Some(0);
                }
                return Err(TimeoutError::IncompleteTelegram {
                    received: response.len(),
                    expected: total,
                }
                .into());
            }
            if let Some(byte) = link.read_byte(inactivity - elapsed)? {
                response.push(byte);
                last_byte = Instant::now();
            }
        }

        let ident = parse_identification(&response)?;
        info!(
            "Adapter type {:#06x}, version {:#06x}",
            ident.adapter_type, ident.adapter_version
        );
        self.adapter_type = Some(ident.adapter_type);
        self.adapter_version = Some(ident.adapter_version);
        Ok(())
    }

    fn check_capable(&self, settings: &LineSettings) -> Result<[u8; 2], ProtocolError> {
        match self.adapter_type {
            Some(t) if t >= MIN_TELEGRAM_ADAPTER_TYPE => {}
            other => {
                return Err(ProtocolError::AdapterUnsupported(format!(
                    "adapter type {:?} has no telegram support",
                    other
                )))
            }
        }
        let half_baud = u16::try_from(settings.baud_rate / 2).map_err(|_| {
            ProtocolError::AdapterUnsupported(format!("baud rate {}", settings.baud_rate))
        })?;
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, half_baud);
        Ok(bytes)
    }

    fn line_flags(settings: &LineSettings, set_dtr: bool) -> Result<u8, ProtocolError> {
        let mut flags = 0u8;
        match settings.parity {
            SerialParity::None => {}
            SerialParity::Even => flags |= FLAG_PARITY_EVEN,
            SerialParity::Odd => flags |= FLAG_PARITY_ODD,
            other => {
                return Err(ProtocolError::AdapterUnsupported(format!(
                    "parity {:?}",
                    other
                )))
            }
        }
        match settings.data_bits {
            8 => {}
            7 => flags |= FLAG_SEVEN_BITS,
            bits => {
                return Err(ProtocolError::AdapterUnsupported(format!(
                    "{} data bits",
                    bits
                )))
            }
        }
        if set_dtr {
            flags |= FLAG_SET_DTR;
        }
        Ok(flags)
    }

    /// Wrap `data` for transmission with the given line settings
    pub fn create_data_telegram(
        &self,
        settings: &LineSettings,
        inter_byte_ms: u8,
        data: &[u8],
        set_dtr: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        let baud = self.check_capable(settings)?;
        let len = u16::try_from(data.len()).map_err(|_| {
            ProtocolError::AdapterUnsupported(format!("{} data bytes", data.len()))
        })?;
        let mut flags = Self::line_flags(settings, set_dtr)? | FLAG_NO_ECHO;
        if self.fast_init {
            flags |= FLAG_FAST_INIT;
        }

        let mut tel = Vec::with_capacity(data.len() + 9);
        tel.push(0x00);
        tel.push(TELEGRAM_DATA);
        tel.extend_from_slice(&baud);
        tel.push(flags);
        tel.push(inter_byte_ms);
        let mut len_bytes = [0u8; 2];
        BigEndian::write_u16(&mut len_bytes, len);
        tel.extend_from_slice(&len_bytes);
        tel.extend_from_slice(data);
        checksum::append(&mut tel);
        Ok(tel)
    }

    /// Encode a bit-banged waveform; an empty pattern only pushes settings
    pub fn create_pulse_telegram(
        &self,
        settings: &LineSettings,
        pattern: u64,
        bit_count: u8,
        pulse_width_us: u32,
        set_dtr: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        let baud = self.check_capable(settings)?;
        if bit_count > MAX_PULSE_BITS {
            return Err(ProtocolError::AdapterUnsupported(format!(
                "{} pulse bits",
                bit_count
            )));
        }
        let width_ms = u16::try_from((pulse_width_us + 500) / 1000).map_err(|_| {
            ProtocolError::AdapterUnsupported(format!("pulse width {}us", pulse_width_us))
        })?;
        let flags = Self::line_flags(settings, set_dtr)?;

        let pattern_len = (bit_count as usize).div_ceil(8);
        let mut tel = Vec::with_capacity(pattern_len + 9);
        tel.push(0x00);
        tel.push(TELEGRAM_PULSE);
        tel.extend_from_slice(&baud);
        tel.push(flags);
        tel.push(bit_count);
        let mut width = [0u8; 2];
        BigEndian::write_u16(&mut width, width_ms);
        tel.extend_from_slice(&width);
        tel.extend_from_slice(&pattern.to_le_bytes()[..pattern_len]);
        checksum::append(&mut tel);
        Ok(tel)
    }
}
