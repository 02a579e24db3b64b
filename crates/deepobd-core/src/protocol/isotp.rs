//! ISO 15765-2 segmentation with BMW extended addressing
//!
//! Every CAN frame carries the target ECU address in its first data byte,
//! followed by the PCI byte. The arbitration ID is `0x600 | source`, so a
//! frame from the tester (0xF1) to the DME (0x12) is `6F1: 12 ...` and the
//! answer arrives as `612: F1 ...`.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::telegram::Telegram;
use super::{ProtocolError, TimeoutError, TransportError};

/// Base of the 11-bit arbitration IDs
pub const CAN_ID_BASE: u16 = 0x600;

/// Data bytes in a classic CAN frame
pub const CAN_FRAME_LEN: usize = 8;

/// Payload bytes in a single frame
pub const SINGLE_FRAME_MAX: usize = 6;

/// Payload bytes in a first frame
pub const FIRST_FRAME_DATA: usize = 5;

/// Payload bytes in a consecutive frame
pub const CONSECUTIVE_FRAME_DATA: usize = 6;

/// Largest message the 12-bit first frame length can announce
pub const MAX_MESSAGE_LEN: usize = 0xFFF;

/// A CAN frame as seen by the ELM327: arbitration ID plus data bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u16, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Low byte of the arbitration ID, the sender's diagnostic address
    pub fn source(&self) -> u8 {
        (self.id & 0xFF) as u8
    }
}

/// Flow control status nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
    Reserved(u8),
}

impl FlowStatus {
    fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0 => FlowStatus::ContinueToSend,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            n => FlowStatus::Reserved(n),
        }
    }

    fn nibble(&self) -> u8 {
        match self {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
            FlowStatus::Reserved(n) => *n & 0x0F,
        }
    }
}

/// One ISO-TP protocol data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    Single {
        data: Vec<u8>,
    },
    First {
        total_len: u16,
        data: Vec<u8>,
    },
    Consecutive {
        sequence: u8,
        data: Vec<u8>,
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        separation_time: u8,
    },
}

impl IsoTpFrame {
    /// Encode into the 8 data bytes of a CAN frame, zero padded
    pub fn encode(&self, address: u8) -> [u8; CAN_FRAME_LEN] {
        let mut out = [0u8; CAN_FRAME_LEN];
        out[0] = address;
        match self {
            IsoTpFrame::Single { data } => {
                let len = data.len().min(SINGLE_FRAME_MAX);
                out[1] = len as u8;
                out[2..2 + len].copy_from_slice(&data[..len]);
            }
            IsoTpFrame::First { total_len, data } => {
                let len = data.len().min(FIRST_FRAME_DATA);
                out[1] = 0x10 | ((total_len >> 8) as u8 & 0x0F);
                out[2] = (*total_len & 0xFF) as u8;
                out[3..3 + len].copy_from_slice(&data[..len]);
            }
            IsoTpFrame::Consecutive { sequence, data } => {
                let len = data.len().min(CONSECUTIVE_FRAME_DATA);
                out[1] = 0x20 | (sequence & 0x0F);
                out[2..2 + len].copy_from_slice(&data[..len]);
            }
            IsoTpFrame::FlowControl {
                status,
                block_size,
                separation_time,
            } => {
                out[1] = 0x30 | status.nibble();
                out[2] = *block_size;
                out[3] = *separation_time;
            }
        }
        out
    }

    /// Decode the data bytes of a CAN frame into (address, frame)
    pub fn decode(data: &[u8]) -> Result<(u8, IsoTpFrame), ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} data bytes, need address and PCI",
                data.len()
            )));
        }
        let address = data[0];
        let pci = data[1];
        let frame = match pci >> 4 {
            0 => {
                let len = (pci & 0x0F) as usize;
                if len > data.len() - 2 {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "single frame announces {} bytes, carries {}",
                        len,
                        data.len() - 2
                    )));
                }
                IsoTpFrame::Single {
                    data: data[2..2 + len].to_vec(),
                }
            }
            1 => {
                if data.len() < CAN_FRAME_LEN {
                    return Err(ProtocolError::InvalidFrame(
                        "first frame shorter than 8 bytes".to_string(),
                    ));
                }
                IsoTpFrame::First {
                    total_len: (((pci & 0x0F) as u16) << 8) | data[2] as u16,
                    data: data[3..3 + FIRST_FRAME_DATA].to_vec(),
                }
            }
            2 => IsoTpFrame::Consecutive {
                sequence: pci & 0x0F,
                data: data[2..].to_vec(),
            },
            3 => {
                if data.len() < 4 {
                    return Err(ProtocolError::InvalidFrame(
                        "flow control shorter than 4 bytes".to_string(),
                    ));
                }
                IsoTpFrame::FlowControl {
                    status: FlowStatus::from_nibble(pci & 0x0F),
                    block_size: data[2],
                    separation_time: data[3],
                }
            }
            other => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "unknown frame type {:X}",
                    other
                )))
            }
        };
        Ok((address, frame))
    }
}

/// STmin byte as a delay: 0..=0x7F ms, 0xF1..=0xF9 hundreds of µs
pub fn separation_time(st: u8) -> Duration {
    match st {
        0x00..=0x7F => Duration::from_millis(st as u64),
        0xF1..=0xF9 => Duration::from_micros((st - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Moves CAN frames for the ISO-TP engine
pub trait CanTransceiver {
    /// Transmit one frame
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Next frame, or `None` after `timeout` of inactivity
    fn receive_frame(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;

    /// True if received bytes are waiting
    fn data_available(&mut self) -> Result<bool, TransportError>;

    /// True once the owner asked the engine to stop
    fn terminated(&self) -> bool {
        false
    }

    /// Delay between consecutive frames
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Segments outbound telegrams
#[derive(Debug, Clone)]
pub struct IsoTpSender {
    fc_timeout: Duration,
    min_separation: Duration,
}

impl IsoTpSender {
    pub fn new(fc_timeout: Duration, min_separation: Duration) -> Self {
        Self {
            fc_timeout,
            min_separation,
        }
    }

    /// Send a BMW-FAST request (checksum optional) as ISO-TP frames.
    ///
    /// `on_progress` runs whenever a flow control frame arrives.
    pub fn send<T: CanTransceiver + ?Sized>(
        &self,
        can: &mut T,
        request: &[u8],
        on_progress: &mut dyn FnMut(),
    ) -> Result<(), TransportError> {
        let tel = Telegram::from_request(request)?;
        let payload = &tel.payload;
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} bytes exceed the ISO-TP limit",
                payload.len()
            ))
            .into());
        }
        let id = CAN_ID_BASE | tel.source as u16;

        if payload.len() <= SINGLE_FRAME_MAX {
            debug!("Send SF");
            let frame = IsoTpFrame::Single {
                data: payload.clone(),
            };
            return can.send_frame(&CanFrame::new(id, frame.encode(tel.target).to_vec()));
        }

        debug!("Send FF");
        let first = IsoTpFrame::First {
            total_len: payload.len() as u16,
            data: payload[..FIRST_FRAME_DATA].to_vec(),
        };
        can.send_frame(&CanFrame::new(id, first.encode(tel.target).to_vec()))?;

        let mut offset = FIRST_FRAME_DATA;
        let mut sequence: u8 = 1;
        let mut block_size: u8 = 0;
        let mut st: u8 = 0;
        let mut wait_for_fc = true;
        loop {
            if wait_for_fc {
                let (bs, sep) = self.wait_flow_control(can, tel.target, tel.source, on_progress)?;
                if can.terminated() {
                    return Ok(());
                }
                block_size = bs;
                st = sep;
            }

            debug!("Send CF");
            let end = (offset + CONSECUTIVE_FRAME_DATA).min(payload.len());
            let frame = IsoTpFrame::Consecutive {
                sequence: sequence & 0x0F,
                data: payload[offset..end].to_vec(),
            };
            can.send_frame(&CanFrame::new(id, frame.encode(tel.target).to_vec()))?;
            offset = end;
            sequence = sequence.wrapping_add(1);
            if offset >= payload.len() {
                return Ok(());
            }

            wait_for_fc = false;
            if block_size > 0 {
                if block_size == 1 {
                    wait_for_fc = true;
                }
                block_size -= 1;
            }
            if !wait_for_fc {
                can.pause(separation_time(st).max(self.min_separation));
            }
            if can.terminated() {
                return Ok(());
            }
        }
    }

    /// Wait for a CTS flow control from `target`; returns (BS, STmin)
    fn wait_flow_control<T: CanTransceiver + ?Sized>(
        &self,
        can: &mut T,
        target: u8,
        source: u8,
        on_progress: &mut dyn FnMut(),
    ) -> Result<(u8, u8), TransportError> {
        debug!("Wait for FC");
        let mut deadline = Instant::now() + self.fc_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("FC timeout");
                return Err(TimeoutError::NoResponse {
                    waited_ms: self.fc_timeout.as_millis() as u64,
                }
                .into());
            }
            let frame = match can.receive_frame(remaining)? {
                Some(frame) => frame,
                None if can.terminated() => return Ok((0, 0)),
                None => continue,
            };
            if can.terminated() {
                return Ok((0, 0));
            }
            // timeout counts bus inactivity
            deadline = Instant::now() + self.fc_timeout;
            if frame.id & 0xFF00 != CAN_ID_BASE || frame.source() != target {
                continue;
            }
            let (status, block_size, st) = match IsoTpFrame::decode(&frame.data) {
                Ok((
                    address,
                    IsoTpFrame::FlowControl {
                        status,
                        block_size,
                        separation_time,
                    },
                )) if address == source => (status, block_size, separation_time),
                _ => continue,
            };

            on_progress();
            debug!("FC {:?} BS={} ST={}", status, block_size, st);
            match status {
                FlowStatus::ContinueToSend => return Ok((block_size, st)),
                FlowStatus::Wait => {
                    debug!("Wait for next FC");
                    deadline = Instant::now() + self.fc_timeout;
                }
                other => return Err(ProtocolError::FlowControlRejected(other.nibble()).into()),
            }
        }
    }
}

/// Progress of one segmented inbound message
#[derive(Debug, Clone)]
pub struct ReassemblyContext {
    pub expected_len: usize,
    pub buffer: Vec<u8>,
    pub source: u8,
    pub target: u8,
    pub next_sequence: u8,
    pub block_countdown: u8,
}

impl ReassemblyContext {
    fn is_complete(&self) -> bool {
        self.buffer.len() >= self.expected_len
    }

    fn into_telegram(self) -> Telegram {
        Telegram::new(self.target, self.source, self.buffer)
    }
}

/// Reassembles inbound frames into BMW-FAST telegrams
#[derive(Debug, Clone)]
pub struct IsoTpReceiver {
    block_size: u8,
    separation_time: u8,
    frame_timeout: Duration,
}

impl IsoTpReceiver {
    pub fn new(block_size: u8, separation_time: u8, frame_timeout: Duration) -> Self {
        Self {
            block_size,
            separation_time,
            frame_timeout,
        }
    }

    fn send_flow_control<T: CanTransceiver + ?Sized>(
        &self,
        can: &mut T,
        ctx: &mut ReassemblyContext,
    ) -> Result<(), TransportError> {
        let fc = IsoTpFrame::FlowControl {
            status: FlowStatus::ContinueToSend,
            block_size: self.block_size,
            separation_time: self.separation_time,
        };
        ctx.block_countdown = self.block_size;
        let id = CAN_ID_BASE | ctx.target as u16;
        can.send_frame(&CanFrame::new(id, fc.encode(ctx.source).to_vec()))
    }

    /// Receive one complete message.
    ///
    /// Returns `Ok(None)` when nothing is waiting. A reassembly that stalls
    /// for longer than the frame timeout fails with
    /// [`TimeoutError::IncompleteTelegram`].
    pub fn receive<T: CanTransceiver + ?Sized>(
        &self,
        can: &mut T,
        on_progress: &mut dyn FnMut(),
    ) -> Result<Option<Telegram>, TransportError> {
        let mut active: Option<ReassemblyContext> = None;
        loop {
            if active.is_none() && !can.data_available()? {
                return Ok(None);
            }
            let frame = match can.receive_frame(self.frame_timeout)? {
                Some(frame) => frame,
                None => {
                    return match active {
                        Some(ctx) => {
                            debug!(
                                "Reassembly stalled at {} of {} bytes",
                                ctx.buffer.len(),
                                ctx.expected_len
                            );
                            Err(TimeoutError::IncompleteTelegram {
                                received: ctx.buffer.len(),
                                expected: ctx.expected_len,
                            }
                            .into())
                        }
                        None => Ok(None),
                    }
                }
            };
            if can.terminated() {
                return Ok(None);
            }

            let decoded = IsoTpFrame::decode(&frame.data);
            match active.as_mut() {
                None => {
                    let (target, iso) = match decoded {
                        Ok(d) => d,
                        Err(e) => {
                            trace!("Ignoring frame: {}", e);
                            continue;
                        }
                    };
                    let source = frame.source();
                    match iso {
                        IsoTpFrame::Single { data } => {
                            debug!("Rec SF");
                            on_progress();
                            return Ok(Some(Telegram::new(target, source, data)));
                        }
                        IsoTpFrame::First { total_len, data } => {
                            debug!("Rec FF");
                            let expected_len = total_len as usize;
                            let mut buffer = Vec::with_capacity(expected_len);
                            buffer.extend_from_slice(&data[..data.len().min(expected_len)]);
                            let mut ctx = ReassemblyContext {
                                expected_len,
                                buffer,
                                source,
                                target,
                                next_sequence: 1,
                                block_countdown: 0,
                            };
                            if ctx.is_complete() {
                                return Ok(Some(ctx.into_telegram()));
                            }
                            self.send_flow_control(can, &mut ctx)?;
                            on_progress();
                            active = Some(ctx);
                        }
                        other => {
                            debug!("Rec invalid frame {:?}", other);
                        }
                    }
                }
                Some(ctx) => {
                    let (address, sequence, data) = match decoded {
                        Ok((address, IsoTpFrame::Consecutive { sequence, data })) => {
                            (address, sequence, data)
                        }
                        _ => continue,
                    };
                    if frame.source() != ctx.source
                        || address != ctx.target
                        || sequence != ctx.next_sequence & 0x0F
                    {
                        continue;
                    }

                    debug!("Rec CF");
                    let wanted = (ctx.expected_len - ctx.buffer.len()).min(CONSECUTIVE_FRAME_DATA);
                    if wanted > data.len() {
                        debug!("Invalid length");
                        continue;
                    }
                    ctx.buffer.extend_from_slice(&data[..wanted]);
                    ctx.next_sequence = ctx.next_sequence.wrapping_add(1);
                    if ctx.block_countdown > 0 && !ctx.is_complete() {
                        ctx.block_countdown -= 1;
                        if ctx.block_countdown == 0 {
                            debug!("(Rec) Send FC");
                            self.send_flow_control(can, ctx)?;
                        }
                    }
                    on_progress();
                }
            }

            if active.as_ref().is_some_and(|ctx| ctx.is_complete()) {
                if let Some(ctx) = active.take() {
                    debug!("Received length: {}", ctx.buffer.len());
                    return Ok(Some(ctx.into_telegram()));
                }
            }
            if can.terminated() {
                return Ok(None);
            }
        }
    }
}
