//! ELM327 session control
//!
//! The ELM327 starts in command mode, where every `AT` command is answered
//! and followed by the `>` prompt. Sending a CAN frame (or `ATMA`) switches
//! it to monitor mode, streaming every received frame as one hex line.
//! Any byte received from the host while streaming stops the monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, trace, warn};

use super::config::TransportConfig;
use super::isotp::{CanFrame, CanTransceiver};
use super::link::LinkChannel;
use super::{ProtocolError, TimeoutError, TransportError};

/// Commands run on connect, in order; each must answer `OK`
pub const INIT_COMMANDS: [&str; 13] = [
    "ATD", "ATE0", "ATSH6F1", "ATCF600", "ATCM700", "ATPBC001", "ATSPB", "ATAT0", "ATSTFF", "ATAL",
    "ATH1", "ATS0", "ATL0",
];

/// Commands only some clones support
pub const OPTIONAL_COMMANDS: [&str; 2] = ["ATCSM0", "ATCTM5"];

const PROMPT: u8 = b'>';
const STOPPED_MARKER: &str = "STOPPED\r";

/// 3 hex digits of header plus up to 8 data bytes
static FRAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\A[0-9a-fA-F]{3,19}\z").ok());

/// Decode a monitor line like `612F10362F190` into a frame
pub fn parse_can_line(line: &str) -> Option<CanFrame> {
    let valid = FRAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(line));
    if line.len() % 2 == 0 || !valid {
        return None;
    }
    let id = u16::from_str_radix(&line[..3], 16).ok()?;
    let data = hex::decode(&line[3..]).ok()?;
    Some(CanFrame::new(id, data))
}

/// Command/monitor state of one ELM327 link
pub struct Elm327 {
    link: LinkChannel,
    data_mode: bool,
    can_header: u16,
    default_header: u16,
    command_timeout: Duration,
    poll_interval: Duration,
    terminate: Arc<AtomicBool>,
}

impl Elm327 {
    pub fn new(link: LinkChannel, config: &TransportConfig, terminate: Arc<AtomicBool>) -> Self {
        Self {
            link,
            data_mode: false,
            can_header: config.default_can_header,
            default_header: config.default_can_header,
            command_timeout: config.elm_command_timeout(),
            poll_interval: config.pump_poll_interval(),
            terminate,
        }
    }

    pub fn data_mode(&self) -> bool {
        self.data_mode
    }

    pub fn can_header(&self) -> u16 {
        self.can_header
    }

    /// Give the link back, e.g. for closing
    pub fn into_link(self) -> LinkChannel {
        self.link
    }

    fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Run the init sequence. Only the first command gets a second try,
    /// it sometimes hits the adapter while still booting.
    pub fn init(&mut self) -> Result<(), TransportError> {
        self.data_mode = false;
        for (index, command) in INIT_COMMANDS.iter().enumerate() {
            let command = if command.starts_with("ATSH") {
                format!("ATSH{:03X}", self.default_header)
            } else {
                command.to_string()
            };
            if let Err(e) = self.send_command(&command, true) {
                if index != 0 {
                    return Err(e);
                }
                debug!("Retrying {} after: {}", command, e);
                self.send_command(&command, true)?;
            }
        }
        self.can_header = self.default_header;

        for command in OPTIONAL_COMMANDS {
            if let Err(e) = self.send_command(command, true) {
                warn!("ELM327 optional command {} failed: {}", command, e);
            }
        }
        info!("ELM327 initialised");
        Ok(())
    }

    /// Read one byte before `deadline`, giving up early on terminate
    fn read_until(&mut self, deadline: Instant) -> Result<Option<u8>, TransportError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.is_terminated() {
                return Ok(None);
            }
            if let Some(byte) = self.link.read_byte(remaining.min(self.poll_interval))? {
                return Ok(Some(byte));
            }
        }
    }

    /// Stop monitor mode and return to the prompt
    pub fn leave_data_mode(&mut self) -> Result<(), TransportError> {
        if !self.data_mode {
            return Ok(());
        }

        let mut captured = String::new();
        while self.link.bytes_available()? > 0 {
            match self.link.read_byte(Duration::ZERO)? {
                Some(byte) => {
                    captured.push(byte as char);
                    if byte == PROMPT {
                        debug!("ELM data mode already terminated: {:?}", captured);
                        self.data_mode = false;
                        return Ok(());
                    }
                }
                None => break,
            }
        }

        self.link.write(b"    ")?;
        debug!("ELM send SPACE");

        let deadline = Instant::now() + self.command_timeout;
        while let Some(byte) = self.read_until(deadline)? {
            captured.push(byte as char);
            if byte == PROMPT {
                if captured.contains(STOPPED_MARKER) {
                    debug!("ELM data mode terminated");
                } else {
                    debug!("ELM data mode not stopped: {:?}", captured);
                }
                self.data_mode = false;
                return Ok(());
            }
        }

        warn!("ELM leave data mode timeout");
        Err(TimeoutError::NoResponse {
            waited_ms: self.command_timeout.as_millis() as u64,
        }
        .into())
    }

    fn prepare_send(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.leave_data_mode() {
            self.data_mode = false;
            return Err(e);
        }
        self.link.flush_input()?;
        Ok(())
    }

    /// Send an AT command; with `read_answer` the reply must contain `OK`
    pub fn send_command(&mut self, command: &str, read_answer: bool) -> Result<(), TransportError> {
        self.prepare_send()?;
        self.link.write(format!("{}\r", command).as_bytes())?;
        debug!("ELM CMD send: {}", command);
        if !read_answer {
            return Ok(());
        }

        let answer = self.receive_answer(self.command_timeout, false)?;
        if !answer.contains("OK\r") {
            debug!("ELM invalid response: {:?}", answer);
            return Err(ProtocolError::CommandRejected {
                command: command.to_string(),
                response: answer,
            }
            .into());
        }
        Ok(())
    }

    /// Switch the transmit header if it differs from the current one
    pub fn set_can_header(&mut self, header: u16) -> Result<(), TransportError> {
        if self.can_header == header {
            return Ok(());
        }
        self.send_command(&format!("ATSH{:03X}", header), true)?;
        self.can_header = header;
        Ok(())
    }

    /// Transmit one frame of data bytes with the current header
    pub fn send_can_frame(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.prepare_send()?;
        let text = hex::encode_upper(data);
        debug!("ELM CAN send: {}", text);
        self.link.write(format!("{}\r", text).as_bytes())?;
        self.data_mode = true;
        Ok(())
    }

    /// Collect answer text. For `can_data`, returns at the first `\r`;
    /// reaching the prompt ends data mode and yields an empty string.
    /// A timeout also yields an empty string.
    pub fn receive_answer(
        &mut self,
        timeout: Duration,
        can_data: bool,
    ) -> Result<String, TransportError> {
        let mut answer = String::new();
        let deadline = Instant::now() + timeout;
        while let Some(byte) = self.read_until(deadline)? {
            if byte == 0x00 {
                continue;
            }
            if can_data && byte == b'\r' {
                trace!("ELM CAN rec: {}", answer);
                return Ok(answer);
            }
            answer.push(byte as char);
            if byte == PROMPT {
                self.data_mode = false;
                if can_data {
                    debug!("ELM data mode aborted");
                    return Ok(String::new());
                }
                debug!("ELM CMD rec: {:?}", answer);
                return Ok(answer);
            }
        }
        trace!("ELM rec timeout");
        Ok(String::new())
    }

    /// Read one monitor line as a frame. Invalid lines yield `None`.
    pub fn receive_can_frame(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        if !self.data_mode {
            return Ok(None);
        }
        let answer = self.receive_answer(timeout, true)?;
        if !self.data_mode {
            // prompt reached, back to monitoring
            self.send_command("ATMA", false)?;
            self.data_mode = true;
        }
        if answer.is_empty() {
            return Ok(None);
        }
        let frame = parse_can_line(&answer);
        if frame.is_none() {
            trace!("Ignoring line {:?}", answer);
        }
        Ok(frame)
    }

    /// Leave data mode before the link goes away. The pump is gone by
    /// now, so its terminate flag no longer applies.
    pub fn exit(&mut self) -> Result<(), TransportError> {
        self.terminate = Arc::new(AtomicBool::new(false));
        if self.data_mode {
            self.leave_data_mode()?;
        }
        Ok(())
    }
}

impl CanTransceiver for Elm327 {
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        self.set_can_header(frame.id)?;
        self.send_can_frame(&frame.data)
    }

    fn receive_frame(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        self.receive_can_frame(timeout)
    }

    fn data_available(&mut self) -> Result<bool, TransportError> {
        Ok(self.link.bytes_available()? > 0)
    }

    fn terminated(&self) -> bool {
        self.is_terminated()
    }

    fn pause(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_terminated() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(self.poll_interval));
        }
    }
}
