//! In-memory RS-485 bus with a scripted RTU device
//!
//! `SimulatedBus` implements [`SerialLine`] so the whole bridge can run
//! without hardware: in tests, where every line action is recorded with a
//! timestamp, and in demo mode, where an echo device answers each request.
//!
//! The device sees each request once the master has drained it, and its
//! [`SimReply`] decides what comes back.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::transport::{LineConfig, SerialLine};
use crate::BROADCAST_UNIT_ID;

/// What the simulated device does with one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// Answer immediately with these bytes
    Respond(Vec<u8>),
    /// Answer with these bytes after a delay
    Delayed(Vec<u8>, Duration),
    /// Answer with these bytes, with a framing fault in the middle
    WithLineError(Vec<u8>),
    /// Never answer
    Silent,
}

/// A recorded line action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub at: Instant,
    pub kind: BusEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEventKind {
    DirectionOn,
    DirectionOff,
    Write(Vec<u8>),
    Drained,
    InputCleared,
    Reconfigured(LineConfig),
}

enum RxItem {
    Bytes(Vec<u8>),
    LineError,
}

type Responder = dyn Fn(&[u8]) -> SimReply + Send + Sync;

struct BusState {
    events: Vec<BusEvent>,
    rx: VecDeque<RxItem>,
    /// Bytes written since the last drain
    pending_tx: Vec<u8>,
    line: Option<LineConfig>,
    direction: bool,
}

struct Shared {
    state: Mutex<BusState>,
    rx_ready: Notify,
    responder: Mutex<Arc<Responder>>,
}

/// Simulated bus; clones share the same bus
#[derive(Clone)]
pub struct SimulatedBus {
    shared: Arc<Shared>,
}

impl SimulatedBus {
    /// Bus with a device answering through `responder`
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> SimReply + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState {
                    events: Vec::new(),
                    rx: VecDeque::new(),
                    pending_tx: Vec::new(),
                    line: None,
                    direction: false,
                }),
                rx_ready: Notify::new(),
                responder: Mutex::new(Arc::new(responder)),
            }),
        }
    }

    /// Bus with a device returning every addressed request unchanged
    pub fn echo() -> Self {
        Self::new(|request| match request.first() {
            Some(&unit) if unit != BROADCAST_UNIT_ID => SimReply::Respond(request.to_vec()),
            _ => SimReply::Silent,
        })
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(state: &mut BusState, kind: BusEventKind) {
        state.events.push(BusEvent { at: Instant::now(), kind });
    }

    /// Swap the device behaviour
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> SimReply + Send + Sync + 'static,
    {
        let mut slot = self.shared.responder.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(responder);
    }

    /// Every line action so far
    pub fn events(&self) -> Vec<BusEvent> {
        self.state().events.clone()
    }

    /// Frames the master has written, one entry per write
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match &event.kind {
                BusEventKind::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Line parameters last applied, if any were
    pub fn line(&self) -> Option<LineConfig> {
        self.state().line
    }

    /// Whether the master currently drives the bus
    pub fn is_transmitting(&self) -> bool {
        self.state().direction
    }

    /// Put bytes on the bus as if a device had sent them unprompted
    pub fn inject(&self, bytes: &[u8]) {
        self.state().rx.push_back(RxItem::Bytes(bytes.to_vec()));
        self.shared.rx_ready.notify_one();
    }

    fn deliver(&self, reply: SimReply) {
        match reply {
            SimReply::Silent => {}
            SimReply::Respond(bytes) => self.inject(&bytes),
            SimReply::Delayed(bytes, delay) => {
                let bus = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    bus.inject(&bytes);
                });
            }
            SimReply::WithLineError(bytes) => {
                let (first, second) = bytes.split_at(bytes.len() / 2);
                {
                    let mut state = self.state();
                    state.rx.push_back(RxItem::Bytes(first.to_vec()));
                    state.rx.push_back(RxItem::LineError);
                    state.rx.push_back(RxItem::Bytes(second.to_vec()));
                }
                self.shared.rx_ready.notify_one();
            }
        }
    }
}

#[async_trait]
impl SerialLine for SimulatedBus {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        state.pending_tx.extend_from_slice(data);
        Self::record(&mut state, BusEventKind::Write(data.to_vec()));
        Ok(())
    }

    async fn drain(&mut self) -> io::Result<()> {
        let (request, wire_time) = {
            let mut state = self.state();
            let request = std::mem::take(&mut state.pending_tx);
            let wire_time = state.line.unwrap_or_default().transmit_time(request.len());
            (request, wire_time)
        };

        tokio::time::sleep(wire_time).await;
        Self::record(&mut self.state(), BusEventKind::Drained);

        if !request.is_empty() {
            let responder = self
                .shared
                .responder
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            self.deliver(responder(&request));
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.shared.rx_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                match state.rx.pop_front() {
                    Some(RxItem::LineError) => {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "framing error"));
                    }
                    Some(RxItem::Bytes(mut bytes)) => {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        if n < bytes.len() {
                            state.rx.push_front(RxItem::Bytes(bytes.split_off(n)));
                        }
                        return Ok(n);
                    }
                    None => {}
                }
            }

            notified.await;
        }
    }

    fn set_direction(&mut self, transmit: bool) -> io::Result<()> {
        let mut state = self.state();
        state.direction = transmit;
        let kind = if transmit { BusEventKind::DirectionOn } else { BusEventKind::DirectionOff };
        Self::record(&mut state, kind);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.rx.clear();
        Self::record(&mut state, BusEventKind::InputCleared);
        Ok(())
    }

    fn apply(&mut self, line: &LineConfig) -> io::Result<()> {
        let mut state = self.state();
        state.line = Some(*line);
        Self::record(&mut state, BusEventKind::Reconfigured(*line));
        Ok(())
    }
}
