//! Bluetooth Transport
//!
//! Carries BMW-FAST telegrams over an RFCOMM serial channel, either to a
//! dedicated BMW-FAST adapter or to a generic ELM327. For the ELM327 the
//! telegrams are segmented into ISO-TP frames in software.

pub mod adapter;
pub mod checksum;
mod config;
mod connection;
pub mod elm327;
mod error;
pub mod isotp;
pub mod link;
pub mod pump;
pub mod serial;
pub mod stream;
pub mod telegram;
pub mod values;

pub use adapter::{AdapterCodec, LineSettings, SerialParity};
pub use config::TransportConfig;
pub use connection::{BluetoothTransport, ConnectionState, PortSpec, TelegramLog, TracingLog};
pub use error::{ConfigError, LinkError, ProtocolError, TimeoutError, TransportError};
pub use isotp::{CanFrame, CanTransceiver, IsoTpFrame, IsoTpReceiver, IsoTpSender};
pub use link::{Connector, LinkChannel, SystemConnector};
pub use serial::{list_ports, open_port, PortInfo};
pub use stream::CommunicationChannel;
pub use telegram::{Telegram, TelegramBuilder, TelegramHeader};
pub use values::Value;

/// Baud rate of BMW-FAST and of the ELM327 link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Port specifier prefix accepted by [`BluetoothTransport::connect`]
pub const PORT_ID: &str = "BLUETOOTH";

/// Port specifier tag selecting the ELM327 path
pub const ELM327_TAG: &str = "ELM327";
