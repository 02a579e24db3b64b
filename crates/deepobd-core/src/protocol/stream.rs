//! Byte streams a link can run over
//!
//! An RFCOMM channel shows up either as a serial device (`/dev/rfcomm0`,
//! `COM5`) or, for SPP bridges and emulators, as a TCP socket. Both are
//! driven through [`CommunicationChannel`].

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Stream under a link (RFCOMM tty, serial port or TCP bridge)
pub trait CommunicationChannel: Read + Write + Send {
    /// Timeout for the next blocking read
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard everything received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Number of bytes that can be read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

impl CommunicationChannel for Box<dyn SerialPort> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::other)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        SerialPort::bytes_to_read(self.as_ref()).map_err(io::Error::other)
    }
}

/// Run `f` with the socket switched to non-blocking mode
fn nonblocking<T>(
    stream: &mut TcpStream,
    f: impl FnOnce(&mut TcpStream) -> io::Result<T>,
) -> io::Result<T> {
    stream.set_nonblocking(true)?;
    let result = f(stream);
    stream.set_nonblocking(false)?;
    result
}

impl CommunicationChannel for TcpStream {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        // zero means "block forever" to the socket API
        // read side only; writes keep the timeout set at connect
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        nonblocking(self, |stream| {
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        nonblocking(self, |stream| {
            // peek reports min(available, buffer)
            let mut buf = [0u8; 4096];
            match stream.peek(&mut buf) {
                Ok(n) => Ok(n as u32),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_tcp_bridge_reports_and_drops_pending_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut bridge, _) = listener.accept().unwrap();

        let mut channel: Box<dyn CommunicationChannel> = Box::new(client);
        assert_eq!(channel.bytes_to_read().unwrap(), 0);

        bridge.write_all(b"OK\r\r>").unwrap();
        bridge.flush().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.bytes_to_read().unwrap() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(channel.bytes_to_read().unwrap(), 5);

        channel.clear_input_buffer().unwrap();
        assert_eq!(channel.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn test_tcp_read_timeout_leaves_writes_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _bridge = listener.accept().unwrap();
        client.set_write_timeout(Some(Duration::from_secs(2))).unwrap();

        CommunicationChannel::set_timeout(&mut client, Duration::from_millis(10)).unwrap();
        assert_eq!(client.read_timeout().unwrap(), Some(Duration::from_millis(10)));
        assert_eq!(client.write_timeout().unwrap(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_tcp_read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _bridge = listener.accept().unwrap();

        CommunicationChannel::set_timeout(&mut client, Duration::ZERO).unwrap();
        let mut byte = [0u8; 1];
        let err = client.read(&mut byte).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
    }
}
