//! Link channel
//!
//! Owns the physical byte stream of one connection. No retries happen here
//! apart from the connect attempts; everything else is up to the callers.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::serial::{clear_buffers, open_port};
use super::stream::CommunicationChannel;
use super::LinkError;

/// Opens the byte stream behind a device address
pub trait Connector: Send + Sync {
    /// Open a fresh channel to `address`
    fn connect(&self, address: &str) -> Result<Box<dyn CommunicationChannel>, LinkError>;
}

/// Connects RFCOMM-bound serial ports and `host:port` network bridges
#[derive(Debug, Clone)]
pub struct SystemConnector {
    baud_rate: u32,
    connect_timeout: Duration,
}

impl SystemConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Looks like `00:11:22:33:44:55`
fn is_device_address(address: &str) -> bool {
    let parts: Vec<&str> = address.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

impl Connector for SystemConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn CommunicationChannel>, LinkError> {
        if address.is_empty() {
            return Err(LinkError::InvalidPort("empty device address".to_string()));
        }
        if is_device_address(address) {
            return Err(LinkError::InvalidPort(format!(
                "{}: bind the device to an RFCOMM serial port first",
                address
            )));
        }

        if address.contains(':') && !address.starts_with('/') {
            let target = address
                .to_socket_addrs()
                .map_err(|e| LinkError::InvalidPort(format!("{}: {}", address, e)))?
                .next()
                .ok_or_else(|| LinkError::InvalidPort(address.to_string()))?;
            let stream = TcpStream::connect_timeout(&target, self.connect_timeout)?;
            stream.set_nodelay(true)?;
            stream.set_write_timeout(Some(self.connect_timeout))?;
            return Ok(Box::new(stream));
        }

        let mut port = open_port(address, Some(self.baud_rate))?;
        clear_buffers(port.as_mut())?;
        Ok(Box::new(port))
    }
}

/// The byte stream of one connection
pub struct LinkChannel {
    channel: Option<Box<dyn CommunicationChannel>>,
    address: String,
}

impl LinkChannel {
    /// A link with nothing attached
    pub fn closed() -> Self {
        Self {
            channel: None,
            address: String::new(),
        }
    }

    /// Wrap an already opened channel
    pub fn from_channel(channel: Box<dyn CommunicationChannel>, address: &str) -> Self {
        Self {
            channel: Some(channel),
            address: address.to_string(),
        }
    }

    /// Open `address`, trying up to `attempts` times.
    ///
    /// RFCOMM connects regularly fail once and then succeed.
    pub fn open(
        connector: &dyn Connector,
        address: &str,
        attempts: u32,
    ) -> Result<Self, LinkError> {
        let attempts = attempts.max(1);
        let mut last_error = LinkError::NotConnected;
        for attempt in 1..=attempts {
            match connector.connect(address) {
                Ok(channel) => {
                    debug!("Link to {} open after {} attempt(s)", address, attempt);
                    return Ok(Self::from_channel(channel, address));
                }
                Err(e @ LinkError::InvalidPort(_)) => return Err(e),
                Err(e) => {
                    warn!("Connect attempt {} to {} failed: {}", attempt, address, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    fn channel(&mut self) -> Result<&mut Box<dyn CommunicationChannel>, LinkError> {
        self.channel.as_mut().ok_or(LinkError::NotConnected)
    }

    /// Release the stream; pending output is flushed first
    pub fn close(&mut self) -> Result<(), LinkError> {
        let mut channel = self.channel.take().ok_or(LinkError::NotConnected)?;
        channel.flush()?;
        debug!("Link to {} closed", self.address);
        Ok(())
    }

    /// Write all bytes and push them out
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let channel = self.channel()?;
        trace!("Link send: {}", hex::encode_upper(bytes));
        channel.write_all(bytes)?;
        channel.flush()?;
        Ok(())
    }

    /// Read one byte, waiting at most `timeout` for it to arrive
    pub fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, LinkError> {
        let channel = self.channel()?;
        if channel.bytes_to_read()? == 0 {
            if timeout.is_zero() {
                return Ok(None);
            }
            channel.set_timeout(timeout)?;
        }

        let mut byte = [0u8; 1];
        match channel.read(&mut byte) {
            Ok(0) => Err(LinkError::IoFailure("stream closed by peer".to_string())),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of received bytes waiting to be read
    pub fn bytes_available(&mut self) -> Result<usize, LinkError> {
        Ok(self.channel()?.bytes_to_read()? as usize)
    }

    /// Discard everything received so far
    pub fn flush_input(&mut self) -> Result<(), LinkError> {
        let channel = self.channel()?;
        channel.clear_input_buffer()?;
        // some stacks keep bytes outside the driver buffer
        let mut byte = [0u8; 1];
        while channel.bytes_to_read()? > 0 {
            if channel.read(&mut byte)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl Default for LinkChannel {
    fn default() -> Self {
        Self::closed()
    }
}
