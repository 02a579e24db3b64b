//! Background pump for the ELM327 path
//!
//! The caller thread hands one request at a time to the pump and blocks on
//! the response queue; the pump thread owns the ELM327 session and runs all
//! ISO-TP traffic, so CAN header and monitor state are never shared.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::config::TransportConfig;
use super::elm327::Elm327;
use super::isotp::{IsoTpReceiver, IsoTpSender};
use super::{TimeoutError, TransportError};

#[derive(Debug)]
struct ExchangeState {
    request: Option<Vec<u8>>,
    responses: VecDeque<u8>,
    /// Last progress seen by either side; receive deadlines count from here
    activity: Instant,
}

/// Pending request and response queue shared by caller and pump
#[derive(Debug)]
pub struct Exchange {
    state: Mutex<ExchangeState>,
    request_ready: Condvar,
    response_ready: Condvar,
    terminate: Arc<AtomicBool>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExchangeState {
                request: None,
                responses: VecDeque::new(),
                activity: Instant::now(),
            }),
            request_ready: Condvar::new(),
            response_ready: Condvar::new(),
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag polled by the pump and every inner wait loop
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Ask the pump to stop and wake it
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.request_ready.notify_all();
        self.response_ready.notify_all();
    }

    /// Queue a request; fails while another one is still pending
    pub fn submit(&self, request: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.request.is_some() {
            return Err(TransportError::RequestPending);
        }
        state.request = Some(request);
        self.request_ready.notify_one();
        Ok(())
    }

    /// Take the pending request, if any
    pub fn take_request(&self) -> Option<Vec<u8>> {
        self.state.lock().request.take()
    }

    /// Sleep until a request arrives, `max` elapses or terminate is set
    pub fn wait_for_request(&self, max: Duration) {
        let mut state = self.state.lock();
        if state.request.is_none() && !self.is_terminated() {
            self.request_ready.wait_for(&mut state, max);
        }
    }

    /// Append a complete response telegram
    pub fn push_response(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.responses.extend(bytes.iter().copied());
        state.activity = Instant::now();
        self.response_ready.notify_all();
    }

    /// Record progress so a waiting caller extends its deadline
    pub fn touch(&self) {
        self.state.lock().activity = Instant::now();
    }

    pub fn clear_responses(&self) {
        self.state.lock().responses.clear();
    }

    /// Copy of what is queued, for logging partial receptions
    pub fn peek_responses(&self) -> Vec<u8> {
        self.state.lock().responses.iter().copied().collect()
    }

    /// Wait until `len` bytes are queued and dequeue exactly those.
    ///
    /// The deadline is `timeout` after the last recorded activity.
    pub fn wait_responses(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        state.activity = Instant::now();
        loop {
            if state.responses.len() >= len {
                return Ok(state.responses.drain(..len).collect());
            }
            let elapsed = state.activity.elapsed();
            if elapsed > timeout || self.is_terminated() {
                let received = state.responses.len();
                warn!("Receive timeout with {} of {} bytes", received, len);
                let err = if received == 0 {
                    TimeoutError::NoResponse {
                        waited_ms: elapsed.as_millis() as u64,
                    }
                } else {
                    TimeoutError::IncompleteTelegram {
                        received,
                        expected: len,
                    }
                };
                return Err(err.into());
            }
            // wake at least once past the deadline
            let wait = timeout - elapsed + Duration::from_millis(1);
            self.response_ready.wait_for(&mut state, wait);
        }
    }
}

/// Worker thread running ISO-TP send and receive cycles
pub struct Pump {
    exchange: Arc<Exchange>,
    handle: Option<JoinHandle<Elm327>>,
}

impl Pump {
    /// Start the worker; it owns `elm` until [`Pump::stop`]
    pub fn start(
        elm: Elm327,
        exchange: Arc<Exchange>,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let sender = IsoTpSender::new(config.elm_data_timeout(), config.min_separation_time());
        let receiver = IsoTpReceiver::new(
            config.elm_block_size,
            config.elm_separation_time_ms,
            config.elm_data_timeout(),
        );
        let poll = config.pump_poll_interval();
        let shared = Arc::clone(&exchange);

        let handle = thread::Builder::new()
            .name("elm327-pump".to_string())
            .spawn(move || run(elm, shared, sender, receiver, poll))?;
        info!("ELM327 pump started");

        Ok(Self {
            exchange,
            handle: Some(handle),
        })
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Stop the worker and take the session back
    pub fn stop(mut self) -> Result<Elm327, TransportError> {
        self.exchange.terminate();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| TransportError::Teardown(vec!["pump already stopped".to_string()]))?;
        let elm = handle
            .join()
            .map_err(|_| TransportError::Teardown(vec!["pump thread panicked".to_string()]))?;
        self.exchange.clear_responses();
        info!("ELM327 pump stopped");
        Ok(elm)
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.exchange.terminate();
            let _ = handle.join();
        }
    }
}

fn run(
    mut elm: Elm327,
    exchange: Arc<Exchange>,
    sender: IsoTpSender,
    receiver: IsoTpReceiver,
    poll: Duration,
) -> Elm327 {
    while !exchange.is_terminated() {
        if let Some(request) = exchange.take_request() {
            if let Err(e) = sender.send(&mut elm, &request, &mut || exchange.touch()) {
                error!("ISO-TP send failed: {}", e);
            }
        }

        match receiver.receive(&mut elm, &mut || exchange.touch()) {
            Ok(Some(tel)) => {
                let bytes = tel.to_bytes();
                debug!("Response telegram: {}", hex::encode_upper(&bytes));
                exchange.push_response(&bytes);
            }
            Ok(None) => {}
            Err(e) => warn!("ISO-TP receive failed: {}", e),
        }

        exchange.wait_for_request(poll);
    }
    elm
}
