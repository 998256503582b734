//! RTU task: the single consumer of the transaction queue
//!
//! The task takes one request at a time off the queue, runs it across the bus
//! through the UART driver and hands the validated answer to the response
//! sink. It is the only writer of transport state, so at most one transaction
//! is ever on the wire and requests are served in queue order.
//!
//! Failed transactions (no answer, bad CRC, wrong unit, overflow) are dropped
//! and logged; the client sees its own TCP-level timeout. With
//! `exception_on_failure` set the client receives a gateway exception instead
//! (0x0B for a silent or unusable device, 0x0A when the bus path failed).

use bytes::Bytes;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use crate::error::{ModbusError, ModbusResult};
use crate::logging::{PacketDirection, PacketLogger};
use crate::protocol::{decode_rtu_frame, encode_rtu_frame, exception_pdu, ModbusException, Session};
use crate::queue::{QueuedTransaction, TransactionQueue};
use crate::server::ClientHandle;
use crate::transport::{LineConfig, UartTransport};
use crate::utils::BridgeStats;

/// Receiver of finished Modbus-TCP response frames
///
/// `deliver` must not block. Returns false when the client is gone; the
/// response is dropped in that case.
pub trait ResponseSink: Send + Sync + 'static {
    fn deliver(&self, client: ClientHandle, frame: Bytes) -> bool;
}

/// RTU task settings
#[derive(Debug, Clone)]
pub struct RtuSettings {
    /// Bound on the wait for the first response byte
    pub response_timeout: Duration,
    /// Answer failed transactions with a gateway exception instead of silence
    pub exception_on_failure: bool,
}

impl Default for RtuSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            exception_on_failure: false,
        }
    }
}

/// How a successful bus transaction ended
///
/// Failures are reported as [`ModbusError`]s instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Response validated and handed to the sink
    Delivered,
    /// Broadcast request, no response expected
    Broadcast,
    /// Valid response, but its client had already gone
    ClientGone,
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransactionOutcome::Delivered => "delivered",
            TransactionOutcome::Broadcast => "broadcast",
            TransactionOutcome::ClientGone => "client gone",
        };
        f.write_str(text)
    }
}

/// Exception a client receives for a failed transaction
///
/// A device that stayed silent or answered garbage failed to respond; a bus
/// the gateway itself could not drive, or flooded past its receive buffer,
/// is an unavailable path.
pub fn gateway_exception(error: &ModbusError) -> ModbusException {
    match error {
        ModbusError::BufferOverflow { .. }
        | ModbusError::Io { .. }
        | ModbusError::Connection { .. }
        | ModbusError::Internal { .. } => ModbusException::GatewayPathUnavailable,
        _ => ModbusException::GatewayTargetDeviceFailedToRespond,
    }
}

pub struct RtuWorker<S: ResponseSink> {
    queue: Arc<TransactionQueue>,
    uart: UartTransport,
    /// Config mutex shared with the configuration provider
    line: Arc<Mutex<LineConfig>>,
    sink: Arc<S>,
    settings: RtuSettings,
    stats: Arc<BridgeStats>,
    packets: PacketLogger,
}

impl<S: ResponseSink> RtuWorker<S> {
    pub fn new(
        queue: Arc<TransactionQueue>,
        uart: UartTransport,
        line: Arc<Mutex<LineConfig>>,
        sink: Arc<S>,
        settings: RtuSettings,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            queue,
            uart,
            line,
            sink,
            settings,
            stats,
            packets: PacketLogger::disabled(),
        }
    }

    pub fn with_packet_logger(mut self, packets: PacketLogger) -> Self {
        self.packets = packets;
        self
    }

    /// Serve the queue until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "🔁 RTU task started (response timeout {:?}, exceptions on failure: {})",
            self.settings.response_timeout, self.settings.exception_on_failure
        );

        loop {
            let transaction = tokio::select! {
                transaction = self.queue.dequeue() => transaction,
                _ = shutdown.recv() => break,
            };

            let gap = self.process(transaction).await;
            tokio::time::sleep(gap).await;
        }

        info!("⏹️  RTU task stopped");
    }

    /// Run one transaction and return the inter-frame gap to observe afterwards
    ///
    /// The config mutex is held from before the request is encoded until the
    /// response has been judged, so line settings never change mid-frame.
    pub async fn process(&mut self, transaction: QueuedTransaction) -> Duration {
        let QueuedTransaction { session, pdu } = transaction;
        let shared_line = Arc::clone(&self.line);
        let line = shared_line.lock().await;

        if *line != self.uart.line() {
            match self.uart.reconfigure(*line).await {
                Ok(()) => info!(
                    "🔧 Serial line now {} baud, parity {}, tx delay {}µs",
                    line.baud_rate, line.parity, line.tx_delay_us
                ),
                Err(e) => error!("Failed to apply serial settings: {}", e),
            }
        }

        let result = self.exchange(&session, &pdu).await;
        let gap = self.uart.line().inter_frame_gap();
        drop(line);

        BridgeStats::incr(&self.stats.transactions);
        match result {
            Ok(TransactionOutcome::Broadcast) => BridgeStats::incr(&self.stats.broadcasts),
            Ok(outcome) => debug!("Transaction {} finished: {}", session, outcome),
            Err(e) => {
                warn!("Transaction {} dropped: {}", session, e);
                if self.settings.exception_on_failure {
                    self.send_gateway_exception(&session, &pdu, gateway_exception(&e));
                }
            }
        }
        gap
    }

    async fn exchange(&mut self, session: &Session, pdu: &[u8]) -> ModbusResult<TransactionOutcome> {
        let request = encode_rtu_frame(session.unit_id, pdu);
        self.packets.log(PacketDirection::RtuRequest, &request);

        self.uart.transmit(&request).await?;
        BridgeStats::add(&self.stats.bytes_to_bus, request.len() as u64);

        if session.is_broadcast() {
            return Ok(TransactionOutcome::Broadcast);
        }

        let frame = match self.uart.receive(self.settings.response_timeout).await? {
            Some(frame) => frame,
            None => {
                BridgeStats::incr(&self.stats.rtu_timeouts);
                return Err(ModbusError::timeout(
                    format!("RTU response from unit {}", session.unit_id),
                    self.settings.response_timeout.as_millis() as u64,
                ));
            }
        };

        BridgeStats::add(&self.stats.bytes_from_bus, frame.data.len() as u64);
        if frame.line_errors > 0 {
            BridgeStats::add(&self.stats.line_errors, frame.line_errors as u64);
            warn!("{} line error(s) while receiving response for {}", frame.line_errors, session);
        }
        self.packets.log(PacketDirection::RtuResponse, &frame.data);

        let result = if frame.overflow {
            BridgeStats::incr(&self.stats.overflows);
            Err(ModbusError::buffer_overflow(frame.data.len()))
        } else {
            self.judge(session, &frame.data)
        };

        self.uart.recycle(frame);
        result
    }

    /// Validate a received RTU frame and deliver it
    fn judge(&self, session: &Session, data: &[u8]) -> ModbusResult<TransactionOutcome> {
        let (unit_id, response_pdu) = decode_rtu_frame(data).map_err(|e| {
            if matches!(e, ModbusError::CrcMismatch { .. }) {
                BridgeStats::incr(&self.stats.crc_mismatches);
            }
            e
        })?;
        if unit_id != session.unit_id {
            BridgeStats::incr(&self.stats.unit_mismatches);
            return Err(ModbusError::unit_mismatch(session.unit_id, unit_id));
        }

        if let [function, code] = response_pdu {
            if function & 0x80 != 0 {
                debug!("{} answered with {}", session, ModbusError::exception(function & 0x7F, *code));
            }
        }
        Ok(self.respond(session, session.frame_response(response_pdu)))
    }

    fn respond(&self, session: &Session, response: Vec<u8>) -> TransactionOutcome {
        self.packets.log(PacketDirection::TcpResponse, &response);
        let len = response.len() as u64;
        if self.sink.deliver(session.client, Bytes::from(response)) {
            BridgeStats::incr(&self.stats.responses_delivered);
            BridgeStats::add(&self.stats.bytes_to_clients, len);
            TransactionOutcome::Delivered
        } else {
            debug!("Client of {} disconnected before its response", session);
            TransactionOutcome::ClientGone
        }
    }

    fn send_gateway_exception(&self, session: &Session, request_pdu: &[u8], exception: ModbusException) {
        let function = request_pdu.first().copied().unwrap_or_default();
        let pdu = exception_pdu(function, exception);
        debug!("Answering {} with {}", session, ModbusError::exception(function, exception.to_u8()));
        if self.respond(session, session.frame_response(&pdu)) == TransactionOutcome::Delivered {
            BridgeStats::incr(&self.stats.exceptions_sent);
        }
    }
}
