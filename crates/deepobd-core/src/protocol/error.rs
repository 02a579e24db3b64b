//! Transport errors

use thiserror::Error;

/// Failures of the physical byte stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link not connected")]
    NotConnected,

    #[error("Link I/O failure: {0}")]
    IoFailure(String),

    #[error("Invalid port specifier: {0}")]
    InvalidPort(String),
}

/// Wire protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Echo mismatch at byte {offset}: sent {expected:#04x}, read back {actual:#04x}")]
    EchoMismatch { offset: usize, expected: u8, actual: u8 },

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Flow control rejected with status {0:#03x}")]
    FlowControlRejected(u8),

    #[error("Adapter does not support this request: {0}")]
    AdapterUnsupported(String),

    #[error("ELM327 rejected '{command}': {response:?}")]
    CommandRejected { command: String, response: String },

    #[error("Operation not supported on this device: {0}")]
    UnsupportedOperation(&'static str),
}

/// Deadline expirations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("No response within {waited_ms}ms")]
    NoResponse { waited_ms: u64 },

    #[error("Incomplete telegram: received {received} of {expected} bytes")]
    IncompleteTelegram { received: usize, expected: usize },
}

/// Misuse of the configuration interface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Any failure surfaced by the transport facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("A request is already pending")]
    RequestPending,

    #[error("Disconnect incomplete: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::IoFailure(err.to_string())
    }
}

impl From<serialport::Error> for LinkError {
    fn from(err: serialport::Error) -> Self {
        LinkError::IoFailure(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Link(err.into())
    }
}

impl TransportError {
    /// True if the failure is a deadline expiry rather than a hard error
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}
