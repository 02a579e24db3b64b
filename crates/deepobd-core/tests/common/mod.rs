//! Simulated Bluetooth devices for integration tests
//!
//! Both simulators implement `CommunicationChannel`, so they plug into a
//! `LinkChannel` or, through `SimConnector`, into a `BluetoothTransport`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use deepobd_core::protocol::adapter::IDENT_PROBE;
use deepobd_core::protocol::checksum;
use deepobd_core::protocol::{
    CanFrame, CommunicationChannel, Connector, LinkChannel, LinkError, TransportConfig,
};
use parking_lot::{Condvar, Mutex};

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Short timeouts so failure paths finish quickly
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        read_timeout_offset_ms: 50,
        echo_timeout_ms: 100,
        elm_read_timeout_offset_ms: 100,
        elm_command_timeout_ms: 300,
        elm_data_timeout_ms: 300,
        adapter_ident_timeout_ms: 100,
        ..TransportConfig::default()
    }
}

/// Simulated device state behind a lock, with a signal for new output
pub struct Shared<T> {
    pub state: Mutex<T>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn new(state: T) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            ready: Condvar::new(),
        })
    }
}

/// Output side of a simulated device
pub trait Device: Send + 'static {
    fn rx(&mut self) -> &mut VecDeque<u8>;
    fn receive(&mut self, bytes: &[u8]);
}

/// Channel end handed to the code under test
pub struct SimChannel<T: Device> {
    shared: Arc<Shared<T>>,
    timeout: Duration,
}

impl<T: Device> Clone for SimChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            timeout: self.timeout,
        }
    }
}

impl<T: Device> SimChannel<T> {
    pub fn new(device: T) -> Self {
        Self {
            shared: Shared::new(device),
            timeout: Duration::from_millis(1),
        }
    }

    /// Inspect or script the simulated device
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.shared.state.lock())
    }

    pub fn link(&self) -> LinkChannel {
        LinkChannel::from_channel(Box::new(self.clone()), "sim")
    }
}

impl<T: Device> Read for SimChannel<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.rx().is_empty() {
            self.shared.ready.wait_for(&mut state, self.timeout);
        }
        let rx = state.rx();
        if rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl<T: Device> Write for SimChannel<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        state.receive(buf);
        self.shared.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Device> CommunicationChannel for SimChannel<T> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.shared.state.lock().rx().clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.shared.state.lock().rx().len() as u32)
    }
}

/// Hands out the same simulated channel on every connect
pub struct SimConnector<T: Device> {
    channel: SimChannel<T>,
    failures: AtomicU32,
    pub attempts: Arc<AtomicU32>,
}

impl<T: Device> SimConnector<T> {
    pub fn new(channel: &SimChannel<T>) -> Self {
        Self::failing(channel, 0)
    }

    /// Fail the first `failures` connects
    pub fn failing(channel: &SimChannel<T>, failures: u32) -> Self {
        Self {
            channel: channel.clone(),
            failures: AtomicU32::new(failures),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl<T: Device> Connector for SimConnector<T> {
    fn connect(&self, _address: &str) -> Result<Box<dyn CommunicationChannel>, LinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(LinkError::IoFailure("connection refused".to_string()));
        }
        Ok(Box::new(self.channel.clone()))
    }
}

// ---------------------------------------------------------------------------
// ELM327 with one ISO-TP ECU behind it
// ---------------------------------------------------------------------------

pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// ECU speaking ISO-TP with BMW extended addressing
pub struct SimEcu {
    pub address: u8,
    pub tester: u8,
    pub responder: Responder,
    /// (status, BS, STmin) sent in reply to each first frame; CTS if empty
    pub fc_script: VecDeque<(u8, u8, u8)>,
    /// Complete request payloads
    pub requests: Vec<Vec<u8>>,
    /// Flow control frames received from the tester
    pub fc_received: usize,
    rx: Option<(usize, Vec<u8>, u8)>,
    tx: VecDeque<u8>,
    tx_seq: u8,
}

impl SimEcu {
    pub fn new(address: u8, responder: Responder) -> Self {
        Self {
            address,
            tester: 0xF1,
            responder,
            fc_script: VecDeque::new(),
            requests: Vec::new(),
            fc_received: 0,
            rx: None,
            tx: VecDeque::new(),
            tx_seq: 1,
        }
    }

    fn line(&self, data: &[u8]) -> String {
        let mut padded = data.to_vec();
        padded.resize(8, 0);
        format!(
            "{:03X}{}\r",
            0x600 | self.address as u16,
            hex::encode_upper(&padded)
        )
    }

    fn complete(&mut self, request: Vec<u8>) -> Vec<String> {
        self.requests.push(request.clone());
        let response = match (self.responder)(&request) {
            Some(response) => response,
            None => return Vec::new(),
        };
        if response.len() <= 6 {
            let mut data = vec![self.tester, response.len() as u8];
            data.extend_from_slice(&response);
            return vec![self.line(&data)];
        }
        let len = response.len();
        let mut data = vec![self.tester, 0x10 | (len >> 8) as u8, (len & 0xFF) as u8];
        data.extend_from_slice(&response[..5]);
        self.tx = response[5..].iter().copied().collect();
        self.tx_seq = 1;
        vec![self.line(&data)]
    }

    fn send_block(&mut self, block_size: u8) -> Vec<String> {
        let mut lines = Vec::new();
        while !self.tx.is_empty() && (block_size == 0 || lines.len() < block_size as usize) {
            let take = self.tx.len().min(6);
            let mut data = vec![self.tester, 0x20 | (self.tx_seq & 0x0F)];
            data.extend(self.tx.drain(..take));
            self.tx_seq = self.tx_seq.wrapping_add(1);
            lines.push(self.line(&data));
        }
        lines
    }

    /// Handle a frame from the tester, returning the ECU's answer lines
    fn handle(&mut self, id: u16, data: &[u8]) -> Vec<String> {
        if id != 0x600 | self.tester as u16 || data.len() < 2 || data[0] != self.address {
            return Vec::new();
        }
        let pci = data[1];
        match pci >> 4 {
            0 => {
                let len = (pci & 0x0F) as usize;
                self.complete(data[2..2 + len].to_vec())
            }
            1 => {
                let total = (((pci & 0x0F) as usize) << 8) | data[2] as usize;
                self.rx = Some((total, data[3..8].to_vec(), 1));
                let script: Vec<(u8, u8, u8)> = if self.fc_script.is_empty() {
                    vec![(0, 0, 0)]
                } else {
                    self.fc_script.drain(..).collect()
                };
                script
                    .into_iter()
                    .map(|(status, bs, st)| self.line(&[self.tester, 0x30 | status, bs, st]))
                    .collect()
            }
            2 => {
                let done = match self.rx.as_mut() {
                    Some((total, buf, seq)) if pci & 0x0F == *seq & 0x0F => {
                        let take = (*total - buf.len()).min(6);
                        buf.extend_from_slice(&data[2..2 + take]);
                        *seq = seq.wrapping_add(1);
                        buf.len() >= *total
                    }
                    _ => false,
                };
                match done.then(|| self.rx.take()).flatten() {
                    Some((_, request, _)) => self.complete(request),
                    None => Vec::new(),
                }
            }
            3 => {
                self.fc_received += 1;
                self.send_block(data[2])
            }
            _ => Vec::new(),
        }
    }
}

/// ELM327 in front of a [`SimEcu`]
pub struct SimElm327 {
    pub ecu: SimEcu,
    /// Every AT command seen, upper case
    pub commands: Vec<String>,
    /// Every CAN frame the tester sent
    pub frames: Vec<CanFrame>,
    /// Every byte written by the host
    pub tx_log: Vec<u8>,
    /// Commands answered with `?`
    pub reject: Vec<String>,
    /// Number of leading AT commands answered with `?`
    pub fail_first: usize,
    /// Prefix every monitor line with NUL
    pub inject_nul: bool,
    /// Print the prompt after the ECU answer, ending monitor mode
    pub prompt_after_output: bool,
    pub monitoring: bool,
    pub header: u16,
    echo: bool,
    line: String,
    rx: VecDeque<u8>,
}

impl SimElm327 {
    pub fn new(ecu: SimEcu) -> Self {
        Self {
            ecu,
            commands: Vec::new(),
            frames: Vec::new(),
            tx_log: Vec::new(),
            reject: Vec::new(),
            fail_first: 0,
            inject_nul: false,
            prompt_after_output: false,
            monitoring: false,
            header: 0x7DF,
            echo: true,
            line: String::new(),
            rx: VecDeque::new(),
        }
    }

    fn output(&mut self, text: &str) {
        self.rx.extend(text.bytes());
    }

    fn handle_line(&mut self, line: String) {
        if line.is_empty() {
            return;
        }
        if self.echo {
            self.output(&format!("{}\r", line));
        }
        let upper = line.to_uppercase();
        if upper.starts_with("AT") {
            self.commands.push(upper.clone());
            if self.fail_first > 0 {
                self.fail_first -= 1;
                self.output("?\r\r>");
                return;
            }
            if self.reject.contains(&upper) {
                self.output("?\r\r>");
                return;
            }
            if upper == "ATE0" {
                self.echo = false;
            } else if let Some(header) = upper.strip_prefix("ATSH") {
                self.header = u16::from_str_radix(header, 16).unwrap_or(0);
            } else if upper == "ATMA" {
                self.monitoring = true;
                return;
            }
            self.output("OK\r\r>");
            return;
        }

        let data = match hex::decode(&upper) {
            Ok(data) => data,
            Err(_) => {
                self.output("?\r\r>");
                return;
            }
        };
        self.frames.push(CanFrame::new(self.header, data.clone()));
        self.monitoring = true;
        let lines = self.ecu.handle(self.header, &data);
        for line in lines {
            if self.inject_nul {
                self.output("\0");
            }
            self.output(&line);
        }
        if self.prompt_after_output {
            self.output(">");
            self.monitoring = false;
        }
    }
}

impl Device for SimElm327 {
    fn rx(&mut self) -> &mut VecDeque<u8> {
        &mut self.rx
    }

    fn receive(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.tx_log.push(b);
            if self.monitoring {
                // any character stops the monitor
                self.monitoring = false;
                self.output("STOPPED\r\r>");
                continue;
            }
            match b {
                b'\r' => {
                    let line = std::mem::take(&mut self.line);
                    self.handle_line(line.trim().to_string());
                }
                b' ' => {}
                _ => self.line.push(b as char),
            }
        }
    }
}

/// ECU answering every request with `prefix` + request[1..]
pub fn echo_ecu(address: u8) -> SimEcu {
    SimEcu::new(
        address,
        Box::new(|request: &[u8]| {
            let mut response = vec![request.first().copied().unwrap_or(0) | 0x40];
            response.extend_from_slice(request.get(1..).unwrap_or_default());
            Some(response)
        }),
    )
}

/// ECU that never answers
pub fn silent_ecu(address: u8) -> SimEcu {
    SimEcu::new(address, Box::new(|_: &[u8]| None))
}

pub fn elm_channel(ecu: SimEcu) -> SimChannel<SimElm327> {
    SimChannel::new(SimElm327::new(ecu))
}

// ---------------------------------------------------------------------------
// Dedicated BMW-FAST adapter
// ---------------------------------------------------------------------------

/// Build the 9-byte identification answer
pub fn ident_response(adapter_type: u16, version: u16) -> Vec<u8> {
    let mut data = vec![0x84, 0xF1, 0xF1, 0xFD];
    data.extend_from_slice(&adapter_type.to_be_bytes());
    data.extend_from_slice(&version.to_be_bytes());
    checksum::append(&mut data);
    data
}

/// BMW-FAST adapter: echoes K-line traffic, answers the identification
/// probe and swallows adapter telegrams
pub struct SimAdapter {
    /// Identification answer; `None` echoes the probe only
    pub ident: Option<Vec<u8>>,
    /// Answers queued after each request, in order
    pub responses: VecDeque<Vec<u8>>,
    /// Flip a bit in the echo
    pub corrupt_echo: bool,
    /// Adapter telegrams (data/pulse) received
    pub telegrams: Vec<Vec<u8>>,
    /// Everything the host wrote
    pub tx_log: Vec<u8>,
    rx: VecDeque<u8>,
}

impl SimAdapter {
    pub fn new(ident: Option<Vec<u8>>) -> Self {
        Self {
            ident,
            responses: VecDeque::new(),
            corrupt_echo: false,
            telegrams: Vec::new(),
            tx_log: Vec::new(),
            rx: VecDeque::new(),
        }
    }

    fn answer(&mut self) {
        if let Some(response) = self.responses.pop_front() {
            self.rx.extend(response);
        }
    }
}

impl Device for SimAdapter {
    fn rx(&mut self) -> &mut VecDeque<u8> {
        &mut self.rx
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.tx_log.extend_from_slice(bytes);
        if bytes == IDENT_PROBE {
            self.rx.extend(IDENT_PROBE);
            if let Some(ident) = self.ident.clone() {
                self.rx.extend(ident);
            }
            return;
        }
        if bytes.first() == Some(&0x00) {
            self.telegrams.push(bytes.to_vec());
            // data telegrams carry a request, pulses do not
            if bytes.get(1) == Some(&0x00) {
                self.answer();
            }
            return;
        }
        let mut echo = bytes.to_vec();
        if self.corrupt_echo {
            if let Some(last) = echo.last_mut() {
                *last ^= 0x01;
            }
        }
        self.rx.extend(echo);
        self.answer();
    }
}

pub fn adapter_channel(ident: Option<Vec<u8>>) -> SimChannel<SimAdapter> {
    SimChannel::new(SimAdapter::new(ident))
}

/// Accepts everything, never answers
#[derive(Default)]
pub struct MuteDevice {
    pub tx_log: Vec<u8>,
    rx: VecDeque<u8>,
}

impl Device for MuteDevice {
    fn rx(&mut self) -> &mut VecDeque<u8> {
        &mut self.rx
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.tx_log.extend_from_slice(bytes);
    }
}
