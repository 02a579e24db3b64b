//! # Deep OBD Core Library
//!
//! Bluetooth transport for EDIABAS-compatible vehicle diagnostics.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - BMW-FAST telegram encoding and checksums
//! - Link management over RFCOMM-bound serial ports or TCP bridges
//! - Dedicated BMW-FAST adapter telegrams (identification, K-line pulses)
//! - ELM327 session control with software ISO-TP (ISO 15765-2)
//!
//! ## Supported adapters
//!
//! - Deep OBD / BMW-FAST Bluetooth adapters
//! - ELM327 Bluetooth clones (CAN only)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use deepobd_core::protocol::{BluetoothTransport, TransportConfig};
//!
//! let mut transport = BluetoothTransport::new(TransportConfig::default())?;
//! transport.connect("BLUETOOTH:/dev/rfcomm0;ELM327")?;
//!
//! // Read identification from the DME
//! transport.send_data(&[0x83, 0x12, 0xF1, 0x22, 0xF1, 0x90, 0x29], false, 0.0)?;
//! let mut header = [0u8; 3];
//! transport.receive_data(&mut header, Duration::from_millis(1000), Duration::from_millis(100), None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        BluetoothTransport, ConnectionState, LineSettings, SerialParity, Telegram,
        TelegramLog, TracingLog, TransportConfig, TransportError, Value,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
