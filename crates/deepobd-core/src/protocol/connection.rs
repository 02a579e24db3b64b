//! Bluetooth transport facade
//!
//! Connects to a BMW-FAST dedicated adapter or an ELM327 over an RFCOMM
//! serial channel and offers the synchronous send/receive interface the
//! diagnostic engine expects. ELM327 sessions run ISO-TP on a pump thread;
//! dedicated adapters are driven directly from the caller thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::adapter::{is_fast_init, AdapterCodec, LineSettings, SerialParity};
use super::config::TransportConfig;
use super::elm327::Elm327;
use super::link::{Connector, LinkChannel, SystemConnector};
use super::pump::{Exchange, Pump};
use super::serial::{list_ports, PortInfo};
use super::values::Value;
use super::{
    ConfigError, LinkError, ProtocolError, TimeoutError, TransportError, DEFAULT_BAUD_RATE,
    ELM327_TAG, PORT_ID,
};

/// Receives protocol-level dumps of received data
pub trait TelegramLog {
    /// Record `data` under a short label such as `"Rec "`
    fn log_data(&self, label: &str, data: &[u8]);
}

/// Writes telegram dumps as `tracing` debug events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl TelegramLog for TracingLog {
    fn log_data(&self, label: &str, data: &[u8]) {
        debug!("{}{}", label, hex::encode_upper(data));
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Link opening or ELM327 init in progress
    Connecting,
    /// Connected and ready
    Connected,
}

/// Parsed `BLUETOOTH:<address>[;ELM327]` port specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Serial device or `host:port` of the adapter
    pub address: String,
    /// The `;ELM327` tag was present
    pub elm327: bool,
}

impl PortSpec {
    pub fn parse(port: &str) -> Result<Self, LinkError> {
        let invalid = || LinkError::InvalidPort(port.to_string());
        let prefix = port.get(..PORT_ID.len()).ok_or_else(invalid)?;
        if !prefix.eq_ignore_ascii_case(PORT_ID) {
            return Err(invalid());
        }
        let rest = port[PORT_ID.len()..].strip_prefix(':').ok_or_else(invalid)?;

        let mut parts = rest.split(';');
        let address = parts.next().unwrap_or_default().trim();
        if address.is_empty() {
            return Err(invalid());
        }
        let elm327 = parts
            .next()
            .is_some_and(|tag| tag.trim().eq_ignore_ascii_case(ELM327_TAG));

        Ok(Self {
            address: address.to_string(),
            elm327,
        })
    }
}

enum Session {
    Adapter {
        link: LinkChannel,
        codec: AdapterCodec,
    },
    Elm327 {
        pump: Pump,
    },
}

/// Bluetooth transport to a BMW-FAST adapter or ELM327
pub struct BluetoothTransport {
    config: TransportConfig,
    connector: Box<dyn Connector>,
    state: ConnectionState,
    session: Option<Session>,
    port: String,
    settings: LineSettings,
    inter_byte_time_ms: u32,
}

impl BluetoothTransport {
    /// Create a transport using the system serial/TCP connector
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        let connector = SystemConnector::new(config.link_baud_rate);
        Self::with_connector(config, Box::new(connector))
    }

    /// Create a transport with a custom way of opening links
    pub fn with_connector(
        config: TransportConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            state: ConnectionState::Disconnected,
            session: None,
            port: String::new(),
            settings: LineSettings::default(),
            inter_byte_time_ms: 0,
        })
    }

    /// List serial ports an adapter may be bound to
    pub fn list_ports() -> Vec<PortInfo> {
        list_ports()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_elm327(&self) -> bool {
        matches!(self.session, Some(Session::Elm327 { .. }))
    }

    /// Line settings last requested via [`set_config`](Self::set_config)
    pub fn settings(&self) -> LineSettings {
        self.settings
    }

    /// Open the link named by `port`. Already connected is not an error.
    pub fn connect(&mut self, port: &str) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let spec = PortSpec::parse(port)?;
        self.state = ConnectionState::Connecting;
        info!(
            "Connecting to {} ({})",
            spec.address,
            if spec.elm327 { "ELM327" } else { "BMW-FAST adapter" }
        );

        let link = match LinkChannel::open(
            self.connector.as_ref(),
            &spec.address,
            self.config.connect_attempts,
        ) {
            Ok(link) => link,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };

        let session = if spec.elm327 {
            match self.start_elm327(link) {
                Ok(session) => session,
                Err(e) => {
                    error!("ELM327 init failed: {}", e);
                    self.state = ConnectionState::Disconnected;
                    return Err(e);
                }
            }
        } else {
            Session::Adapter {
                link,
                codec: AdapterCodec::new(),
            }
        };

        self.session = Some(session);
        self.port = port.to_string();
        self.state = ConnectionState::Connected;
        info!("Connected to {}", spec.address);
        Ok(())
    }

    fn start_elm327(&self, link: LinkChannel) -> Result<Session, TransportError> {
        let exchange = Arc::new(Exchange::new());
        let mut elm = Elm327::new(link, &self.config, exchange.terminate_flag());
        if let Err(e) = elm.init() {
            let mut link = elm.into_link();
            if let Err(close_err) = link.close() {
                debug!("Closing link after failed init: {}", close_err);
            }
            return Err(e);
        }
        let pump = Pump::start(elm, exchange, &self.config)?;
        Ok(Session::Elm327 { pump })
    }

    /// Tear everything down. Every step runs even if an earlier one fails;
    /// the failures are reported together.
    pub fn disconnect(&mut self) -> Result<(), TransportError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                self.state = ConnectionState::Disconnected;
                return Ok(());
            }
        };
        let mut failures = Vec::new();

        let link = match session {
            Session::Elm327 { pump } => match pump.stop() {
                Ok(mut elm) => {
                    if let Err(e) = elm.exit() {
                        failures.push(format!("leave data mode: {}", e));
                    }
                    Some(elm.into_link())
                }
                Err(e) => {
                    failures.push(format!("stop pump: {}", e));
                    None
                }
            },
            Session::Adapter { link, .. } => Some(link),
        };
        if let Some(mut link) = link {
            if let Err(e) = link.close() {
                failures.push(format!("close link: {}", e));
            }
        }

        self.state = ConnectionState::Disconnected;
        self.port.clear();
        if failures.is_empty() {
            info!("Disconnected");
            Ok(())
        } else {
            warn!("Disconnect incomplete: {}", failures.join("; "));
            Err(TransportError::Teardown(failures))
        }
    }

    /// Record line settings; they reach the adapter with the next transfer
    pub fn set_config(
        &mut self,
        baud_rate: u32,
        data_bits: u8,
        parity: SerialParity,
        allow_bit_bang: bool,
    ) -> Result<(), ConfigError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ConfigError::InvalidState("not connected".to_string()))?;
        if baud_rate == 0 {
            return Err(ConfigError::InvalidValue("baud rate 0".to_string()));
        }
        debug!(
            "Config {} {}{:?} (bit bang {})",
            baud_rate, data_bits, parity, allow_bit_bang
        );
        self.settings = LineSettings {
            baud_rate,
            data_bits,
            parity,
        };
        if let Session::Adapter { codec, .. } = session {
            codec.set_fast_init(false);
        }
        Ok(())
    }

    /// Send a BMW-FAST request.
    ///
    /// On an ELM327 the request is queued for the pump and this returns at
    /// once. A dedicated adapter at 115200 baud gets the raw bytes and must
    /// echo them; other rates go out as adapter data telegrams.
    pub fn send_data(
        &mut self,
        data: &[u8],
        set_dtr: bool,
        dtr_time_correction: f64,
    ) -> Result<(), TransportError> {
        let settings = self.settings;
        let inter_byte = self.inter_byte_time_ms.min(u8::MAX as u32) as u8;
        let echo_timeout = self.config.echo_timeout() + self.config.read_timeout_offset();
        let ident_timeout = self.config.adapter_ident_timeout();
        trace!(
            "Send {} bytes (dtr {}, correction {})",
            data.len(),
            set_dtr,
            dtr_time_correction
        );

        match self.session.as_mut() {
            None => Err(LinkError::NotConnected.into()),
            Some(Session::Elm327 { pump }) => {
                if !settings.is_bmw_fast() {
                    return Err(ConfigError::InvalidState(format!(
                        "ELM327 needs 115200 8N1, configured {} {}{:?}",
                        settings.baud_rate, settings.data_bits, settings.parity
                    ))
                    .into());
                }
                pump.exchange().submit(data.to_vec())
            }
            Some(Session::Adapter { link, codec }) => {
                if settings.baud_rate == DEFAULT_BAUD_RATE {
                    link.write(data)?;
                    let mut echo = vec![0u8; data.len()];
                    read_with_timeouts(link, &mut echo, echo_timeout, echo_timeout)?;
                    if let Some((offset, (&expected, &actual))) = data
                        .iter()
                        .zip(echo.iter())
                        .enumerate()
                        .find(|(_, (sent, read))| sent != read)
                    {
                        return Err(ProtocolError::EchoMismatch {
                            offset,
                            expected,
                            actual,
                        }
                        .into());
                    }
                    return Ok(());
                }

                if let Err(e) = codec.update_info(link, false, ident_timeout) {
                    debug!("Adapter identification failed: {}", e);
                }
                let telegram = codec.create_data_telegram(&settings, inter_byte, data, set_dtr);
                codec.set_fast_init(false);
                let telegram = telegram?;
                link.write(&telegram)?;
                codec.update_active_settings(&settings);
                Ok(())
            }
        }
    }

    /// Fill `buffer` with received bytes.
    ///
    /// `timeout` bounds the wait for the first byte, `timeout_tel_end` the
    /// silence between later ones. Both are extended by a fixed allowance
    /// for adapter latency. On failure the logger sees what was captured.
    pub fn receive_data(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
        timeout_tel_end: Duration,
        log: Option<&dyn TelegramLog>,
    ) -> Result<(), TransportError> {
        let settings = self.settings;
        let elm_offset = self.config.elm_read_timeout_offset();
        let offset = self.config.read_timeout_offset();
        let ident_timeout = self.config.adapter_ident_timeout();

        match self.session.as_mut() {
            None => Err(LinkError::NotConnected.into()),
            Some(Session::Elm327 { pump }) => {
                let exchange = pump.exchange();
                match exchange.wait_responses(buffer.len(), timeout + elm_offset) {
                    Ok(bytes) => {
                        buffer.copy_from_slice(&bytes);
                        if let Some(log) = log {
                            log.log_data("Rec ", buffer);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        if let Some(log) = log {
                            log.log_data("Rec ", &exchange.peek_responses());
                        }
                        Err(e)
                    }
                }
            }
            Some(Session::Adapter { link, codec }) => {
                if codec.settings_update_required(&settings) {
                    if let Err(e) = codec.update_info(link, false, ident_timeout) {
                        debug!("Adapter identification failed: {}", e);
                    }
                    let telegram = codec.create_pulse_telegram(&settings, 0, 0, 0, false)?;
                    link.write(&telegram)?;
                    codec.update_active_settings(&settings);
                }

                let result =
                    read_with_timeouts(link, buffer, timeout + offset, timeout_tel_end + offset);
                match (&result, log) {
                    (Ok(()), Some(log)) => log.log_data("Rec ", buffer),
                    (Err(e), Some(log)) => log.log_data("Rec ", &buffer[..captured(e)]),
                    _ => {}
                }
                result
            }
        }
    }

    /// Emit a bit pattern on the K-line (dedicated adapters only).
    ///
    /// The fast-init waveform is not sent on its own; it is flagged on the
    /// next data telegram instead.
    pub fn send_pulse(
        &mut self,
        pattern: u64,
        bit_count: u8,
        pulse_width_us: u32,
        set_dtr: bool,
    ) -> Result<(), TransportError> {
        let settings = self.settings;
        let ident_timeout = self.config.adapter_ident_timeout();
        match self.session.as_mut() {
            None => Err(LinkError::NotConnected.into()),
            Some(Session::Elm327 { .. }) => {
                Err(ProtocolError::UnsupportedOperation("K-line pulse on ELM327").into())
            }
            Some(Session::Adapter { link, codec }) => {
                if let Err(e) = codec.update_info(link, false, ident_timeout) {
                    debug!("Adapter identification failed: {}", e);
                }
                let fast_init = is_fast_init(pattern, bit_count, pulse_width_us);
                codec.set_fast_init(fast_init);
                if fast_init {
                    debug!("Fast init deferred to next telegram");
                    return Ok(());
                }
                let telegram = codec.create_pulse_telegram(
                    &settings,
                    pattern,
                    bit_count,
                    pulse_width_us,
                    set_dtr,
                )?;
                link.write(&telegram)?;
                codec.update_active_settings(&settings);
                Ok(())
            }
        }
    }

    /// Identify the dedicated adapter, optionally even if already known
    pub fn update_adapter_info(&mut self, force: bool) -> Result<(), TransportError> {
        let ident_timeout = self.config.adapter_ident_timeout();
        match self.session.as_mut() {
            None => Err(LinkError::NotConnected.into()),
            Some(Session::Elm327 { .. }) => {
                Err(ProtocolError::UnsupportedOperation("adapter identification on ELM327").into())
            }
            Some(Session::Adapter { link, codec }) => codec.update_info(link, force, ident_timeout),
        }
    }

    /// DTR is not wired through Bluetooth; accepted while connected
    pub fn set_dtr(&mut self, _dtr: bool) -> Result<(), LinkError> {
        self.require_connected()
    }

    /// RTS is not wired through Bluetooth; accepted while connected
    pub fn set_rts(&mut self, _rts: bool) -> Result<(), LinkError> {
        self.require_connected()
    }

    /// DSR always reads high while connected
    pub fn get_dsr(&self) -> Result<bool, LinkError> {
        self.require_connected()?;
        Ok(true)
    }

    pub fn set_break(&mut self, _enable: bool) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnsupportedOperation("break"))
    }

    pub fn set_inter_byte_time(&mut self, time_ms: u32) {
        self.inter_byte_time_ms = time_ms;
    }

    /// Drop everything received but not yet consumed
    pub fn purge_in_buffer(&mut self) -> Result<(), TransportError> {
        match self.session.as_mut() {
            None => Err(LinkError::NotConnected.into()),
            Some(Session::Elm327 { pump }) => {
                pump.exchange().clear_responses();
                Ok(())
            }
            Some(Session::Adapter { link, .. }) => Ok(link.flush_input()?),
        }
    }

    /// Received data never contains the request echo
    pub fn adapter_echo(&self) -> bool {
        false
    }

    pub fn has_precise_timeout(&self) -> bool {
        false
    }

    pub fn adapter_type(&self) -> Option<u16> {
        match &self.session {
            Some(Session::Adapter { codec, .. }) => codec.adapter_type(),
            _ => None,
        }
    }

    pub fn adapter_version(&self) -> Option<u16> {
        match &self.session {
            Some(Session::Adapter { codec, .. }) => codec.adapter_version(),
            _ => None,
        }
    }

    /// Named values describing the connection
    pub fn interface_info(&self) -> Vec<(String, Value)> {
        let device = match &self.session {
            Some(Session::Elm327 { .. }) => ELM327_TAG,
            Some(Session::Adapter { .. }) => "BMW-FAST",
            None => "NONE",
        };
        let as_int = |v: Option<u16>| v.map_or(-1, i64::from);
        vec![
            ("PORT".to_string(), Value::from(self.port.as_str())),
            ("DEVICE".to_string(), Value::from(device)),
            (
                "CONNECTED".to_string(),
                Value::Integer(self.is_connected() as i64),
            ),
            (
                "ADAPTER_TYPE".to_string(),
                Value::Integer(as_int(self.adapter_type())),
            ),
            (
                "ADAPTER_VERSION".to_string(),
                Value::Integer(as_int(self.adapter_version())),
            ),
            (
                "BAUD_RATE".to_string(),
                Value::Integer(self.settings.baud_rate as i64),
            ),
        ]
    }

    fn require_connected(&self) -> Result<(), LinkError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

impl Drop for BluetoothTransport {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.disconnect() {
                warn!("Disconnect on drop: {}", e);
            }
        }
    }
}

/// Bytes captured before `err` ended a read
fn captured(err: &TransportError) -> usize {
    match err {
        TransportError::Timeout(TimeoutError::IncompleteTelegram { received, .. }) => *received,
        _ => 0,
    }
}

/// Fill `buffer`, allowing `first` for the first byte and `inactivity`
/// between later bytes
fn read_with_timeouts(
    link: &mut LinkChannel,
    buffer: &mut [u8],
    first: Duration,
    inactivity: Duration,
) -> Result<(), TransportError> {
    let mut received = 0;
    let mut last = Instant::now();
    while received < buffer.len() {
        let limit = if received == 0 { first } else { inactivity };
        let elapsed = last.elapsed();
        if elapsed >= limit {
            trace!("Receive timeout after {} bytes", received);
            let err = if received == 0 {
                TimeoutError::NoResponse {
                    waited_ms: elapsed.as_millis() as u64,
                }
            } else {
                TimeoutError::IncompleteTelegram {
                    received,
                    expected: buffer.len(),
                }
            };
            return Err(err.into());
        }
        if let Some(byte) = link.read_byte(limit - elapsed)? {
            buffer[received] = byte;
            received += 1;
            last = Instant::now();
        }
    }
    Ok(())
}
