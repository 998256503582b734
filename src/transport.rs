//! # RTU Serial Transport
//!
//! Half-duplex RS-485 transport for the RTU side of the bridge.
//!
//! ## Structure
//!
//! ### Line timing (`LineConfig`)
//! - Character duration from baud rate and parity (10 bits without parity, 11 with)
//! - Silence timeout that delimits a received frame
//! - Inter-frame gap the master observes between transmissions
//! - Direction-enable settle delay
//!
//! ### Hardware seam (`SerialLine`)
//! Byte I/O, transmit drain, receive flush, direction line and live
//! reconfiguration. Implemented for real ports by `SerialPortLine` and for
//! tests by `crate::simulator::SimulatedBus`.
//!
//! ### Driver task (`spawn_uart`)
//! Plays the part of the UART interrupt handler. It alone touches the line;
//! the RTU task talks to it only through commands carrying lent buffers and
//! one-shot completion events, never through shared mutable state.
//!
//! ### Task-side handle (`UartTransport`)
//! Used by the RTU task to run one transmit/receive cycle at a time.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use modbus_rtu_bridge::transport::{spawn_uart, LineConfig, SerialPortLine};
//! use std::time::Duration;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let line = LineConfig::default();
//!     let port = SerialPortLine::open("/dev/ttyUSB0", &line, false)?;
//!     let (shutdown_tx, _) = broadcast::channel(1);
//!
//!     let (mut uart, _driver) = spawn_uart(port, line, shutdown_tx.subscribe());
//!     uart.transmit(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]).await?;
//!
//!     if let Some(frame) = uart.receive(Duration::from_millis(1000)).await? {
//!         println!("Received {} bytes", frame.data.len());
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_serial::SerialPort;

use crate::error::{ModbusError, ModbusResult};
use crate::MAX_RTU_FRAME_SIZE;

/// Bytes drained from the line per read, mirroring the hardware FIFO depth
const RX_FIFO_CHUNK: usize = 128;

/// Below this rate the inter-frame silence scales with the character time;
/// above it the fixed 1750 µs floor applies
const FIXED_SILENCE_BAUD: u32 = 19_200;

/// Depth of the command channel to the driver task
const COMMAND_QUEUE_DEPTH: usize = 4;

/// How long past its cutoff the task still waits for the driver's answer
const RECEIVE_GRACE: Duration = Duration::from_millis(50);

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "ParityRepr")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Accepts either the name or the numeric code (0=none, 1=odd, 2=even)
#[derive(Deserialize)]
#[serde(untagged)]
enum ParityRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<ParityRepr> for Parity {
    type Error = ModbusError;

    fn try_from(repr: ParityRepr) -> Result<Self, Self::Error> {
        match repr {
            ParityRepr::Code(code) => Parity::from_u8(code),
            ParityRepr::Name(name) => name.parse(),
        }
    }
}

impl Parity {
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code {
            0 => Ok(Parity::None),
            1 => Ok(Parity::Odd),
            2 => Ok(Parity::Even),
            _ => Err(ModbusError::configuration(format!("Parity code {} outside 0..=2", code))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
        }
    }

    fn to_serial(self) -> tokio_serial::Parity {
        match self {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl FromStr for Parity {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" | "0" => Ok(Parity::None),
            "odd" | "o" | "1" => Ok(Parity::Odd),
            "even" | "e" | "2" => Ok(Parity::Even),
            other => Err(ModbusError::configuration(format!("Unknown parity '{}'", other))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
        };
        f.write_str(name)
    }
}

/// Live serial line parameters
///
/// Guarded by the config mutex shared between the RTU task and the
/// configuration provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    /// Direction-enable settle time before the first byte, in microseconds
    pub tx_delay_us: u32,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            parity: Parity::None,
            tx_delay_us: 0,
        }
    }
}

impl LineConfig {
    /// Bits per character on the wire: start, 8 data, optional parity, stop
    pub fn frame_bits(&self) -> u32 {
        match self.parity {
            Parity::None => 10,
            Parity::Odd | Parity::Even => 11,
        }
    }

    /// Time to transmit one character
    pub fn char_duration(&self) -> Duration {
        let baud = self.baud_rate.max(1) as u64;
        Duration::from_nanos(self.frame_bits() as u64 * 1_000_000_000 / baud)
    }

    /// Silence that ends a received frame (3.5 characters, 1750 µs at high rates)
    pub fn silence_timeout(&self) -> Duration {
        if self.baud_rate > FIXED_SILENCE_BAUD {
            Duration::from_micros(1750)
        } else {
            self.char_duration() * 7 / 2
        }
    }

    /// Minimum bus silence between two master transmissions
    pub fn inter_frame_gap(&self) -> Duration {
        self.silence_timeout()
    }

    /// Direction-enable hold time before the first byte
    pub fn settle_delay(&self) -> Duration {
        Duration::from_micros(self.tx_delay_us as u64)
    }

    /// Time a frame of `bytes` characters occupies the wire
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        self.char_duration() * bytes as u32
    }
}

/// Hardware seam of the RTU transport
///
/// Only the UART driver task calls these. Implementations must not buffer
/// writes beyond what [`SerialLine::drain`] waits for.
#[async_trait]
pub trait SerialLine: Send + 'static {
    /// Queue all bytes for transmission
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait until every written byte has left the transmitter
    async fn drain(&mut self) -> io::Result<()>;

    /// Read whatever bytes are available, waiting for at least one
    ///
    /// Framing and parity faults surface as `ErrorKind::InvalidData`.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drive the RS-485 direction-enable line (true = transmit)
    fn set_direction(&mut self, transmit: bool) -> io::Result<()>;

    /// Discard anything sitting in the receive path
    fn clear_input(&mut self) -> io::Result<()>;

    /// Apply new line parameters
    fn apply(&mut self, line: &LineConfig) -> io::Result<()>;
}

/// Serial port backed line, with RTS driving the transceiver direction
pub struct SerialPortLine {
    port: tokio_serial::SerialStream,
    direction_active_low: bool,
}

impl SerialPortLine {
    /// Open a serial port with 8 data bits and 1 stop bit
    pub fn open(path: &str, line: &LineConfig, direction_active_low: bool) -> ModbusResult<Self> {
        let builder = tokio_serial::new(path, line.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(line.parity.to_serial())
            .flow_control(tokio_serial::FlowControl::None);

        let port = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| ModbusError::connection(format!("Failed to open serial port {}: {}", path, e)))?;

        let mut serial = Self { port, direction_active_low };
        serial
            .set_direction(false)
            .map_err(|e| ModbusError::connection(format!("Failed to release direction line on {}: {}", path, e)))?;
        Ok(serial)
    }
}

#[async_trait]
impl SerialLine for SerialPortLine {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(&mut self.port, data).await?;
        AsyncWriteExt::flush(&mut self.port).await
    }

    async fn drain(&mut self) -> io::Result<()> {
        loop {
            let pending = SerialPort::bytes_to_write(&self.port).map_err(io::Error::from)?;
            if pending == 0 {
                return Ok(());
            }
            sleep(Duration::from_micros(200)).await;
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(&mut self.port, buf).await
    }

    fn set_direction(&mut self, transmit: bool) -> io::Result<()> {
        let level = transmit != self.direction_active_low;
        SerialPort::write_request_to_send(&mut self.port, level).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        SerialPort::clear(&self.port, tokio_serial::ClearBuffer::Input).map_err(io::Error::from)
    }

    fn apply(&mut self, line: &LineConfig) -> io::Result<()> {
        SerialPort::set_baud_rate(&mut self.port, line.baud_rate).map_err(io::Error::from)?;
        SerialPort::set_parity(&mut self.port, line.parity.to_serial()).map_err(io::Error::from)
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub timeouts: u64,
    pub overflows: u64,
    pub line_errors: u64,
}

/// A received frame, handed back in the buffer the task lent for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub data: Vec<u8>,
    /// Bytes arrived that did not fit and were discarded
    pub overflow: bool,
    /// Framing/parity faults seen while receiving
    pub line_errors: u32,
}

/// Commands from the RTU task to the driver
enum UartCommand {
    Transmit {
        frame: Vec<u8>,
        done: oneshot::Sender<io::Result<Vec<u8>>>,
    },
    Receive {
        buffer: Vec<u8>,
        deadline: Instant,
        /// Hard end of the reception, even if the line keeps talking
        cutoff: Instant,
        done: oneshot::Sender<io::Result<RxFrame>>,
    },
    Reconfigure {
        line: LineConfig,
        done: oneshot::Sender<io::Result<()>>,
    },
}

/// State of the task-side handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartState {
    Idle,
    Transmitting,
    AwaitingResponse,
}

/// Driver task body: owns the line and serves one command at a time
struct UartDriver<L: SerialLine> {
    line_io: L,
    line: LineConfig,
}

impl<L: SerialLine> UartDriver<L> {
    async fn run(mut self, mut commands: mpsc::Receiver<UartCommand>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let command = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            match command {
                UartCommand::Transmit { frame, done } => {
                    let result = self.transmit(&frame).await.map(|_| frame);
                    let _ = done.send(result);
                }
                UartCommand::Receive { buffer, deadline, cutoff, mut done } => {
                    tokio::select! {
                        result = self.receive(buffer, deadline, cutoff) => {
                            let _ = done.send(result);
                        }
                        _ = done.closed() => debug!("Receive abandoned by the RTU task"),
                    }
                }
                UartCommand::Reconfigure { line, done } => {
                    let result = self.line_io.apply(&line);
                    if result.is_ok() {
                        self.line = line;
                    }
                    let _ = done.send(result);
                }
            }
        }

        let _ = self.line_io.set_direction(false);
        debug!("UART driver stopped");
    }

    async fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        // late bytes from an earlier exchange must not pass for the next answer
        self.line_io.clear_input()?;

        self.line_io.set_direction(true)?;
        let settle = self.line.settle_delay();
        if !settle.is_zero() {
            sleep(settle).await;
        }

        let sent = async {
            self.line_io.write_all(frame).await?;
            self.line_io.drain().await?;
            // last stop bit is still on the wire when the drain completes
            sleep(self.line.char_duration()).await;
            Ok::<(), io::Error>(())
        }
        .await;

        let released = self.line_io.set_direction(false);
        sent.and(released)
    }

    async fn receive(&mut self, mut buffer: Vec<u8>, deadline: Instant, cutoff: Instant) -> io::Result<RxFrame> {
        buffer.clear();
        let limit = MAX_RTU_FRAME_SIZE;
        let silence = self.line.silence_timeout();
        let mut chunk = [0u8; RX_FIFO_CHUNK];
        let mut overflow = false;
        let mut line_errors = 0u32;

        loop {
            let now = Instant::now();
            if now >= cutoff {
                warn!("RTU reception cut off after {} bytes, line never went silent", buffer.len());
                break;
            }
            // before the first byte the response deadline bounds the wait,
            // afterwards inter-character silence ends the frame
            let wait = if buffer.is_empty() && !overflow {
                deadline.saturating_duration_since(now)
            } else {
                silence
            }
            .min(cutoff.saturating_duration_since(now));

            match timeout(wait, self.line_io.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if overflow || buffer.len() + n > limit {
                        if !overflow {
                            warn!("RTU receive overflow after {} bytes, flushing input", buffer.len());
                        }
                        overflow = true;
                        self.line_io.clear_input()?;
                    } else {
                        buffer.extend_from_slice(&chunk[..n]);
                    }
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    line_errors += 1;
                    warn!("RTU line error during reception: {}", e);
                }
                Ok(Err(e)) => {
                    error!("RTU read failed: {}", e);
                    return Err(e);
                }
            }
        }

        Ok(RxFrame {
            data: buffer,
            overflow,
            line_errors,
        })
    }
}

/// Start the driver task for `line_io`
///
/// The returned handle is the only way to reach the line afterwards.
pub fn spawn_uart<L: SerialLine>(
    line_io: L,
    line: LineConfig,
    shutdown: broadcast::Receiver<()>,
) -> (UartTransport, JoinHandle<()>) {
    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let driver = UartDriver { line_io, line };
    let handle = tokio::spawn(driver.run(command_rx, shutdown));

    let transport = UartTransport {
        commands,
        line,
        state: UartState::Idle,
        rx_buffer: Some(Vec::with_capacity(MAX_RTU_FRAME_SIZE)),
        tx_buffer: Some(Vec::with_capacity(MAX_RTU_FRAME_SIZE)),
        stats: TransportStats::default(),
    };
    (transport, handle)
}

/// Task-side handle to the UART driver
pub struct UartTransport {
    commands: mpsc::Sender<UartCommand>,
    line: LineConfig,
    state: UartState,
    /// Buffers lent to the driver for one operation and returned with its completion
    rx_buffer: Option<Vec<u8>>,
    tx_buffer: Option<Vec<u8>>,
    stats: TransportStats,
}

impl UartTransport {
    pub fn state(&self) -> UartState {
        self.state
    }

    /// Line parameters last applied to the port
    pub fn line(&self) -> LineConfig {
        self.line
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn driver_gone() -> ModbusError {
        ModbusError::internal("UART driver task is not running")
    }

    /// Send one frame with direction control, returning once it has left the wire
    pub async fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let mut lent = self.tx_buffer.take().unwrap_or_default();
        lent.clear();
        lent.extend_from_slice(frame);

        self.state = UartState::Transmitting;
        let (done, completion) = oneshot::channel();
        let result = async {
            self.commands
                .send(UartCommand::Transmit { frame: lent, done })
                .await
                .map_err(|_| Self::driver_gone())?;
            completion.await.map_err(|_| Self::driver_gone())?.map_err(ModbusError::from)
        }
        .await;
        self.state = UartState::Idle;

        let returned = result?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += returned.len() as u64;
        self.tx_buffer = Some(returned);
        Ok(())
    }

    /// Collect one response frame, bounded by `response_timeout`
    ///
    /// `Ok(None)` means the device stayed silent. The driver gives up at a
    /// hard cutoff one full frame past the deadline; if its answer still does
    /// not arrive shortly after, the reception is abandoned and the driver
    /// drops it, so the next transmit is never queued behind it.
    pub async fn receive(&mut self, response_timeout: Duration) -> ModbusResult<Option<RxFrame>> {
        let buffer = self
            .rx_buffer
            .take()
            .unwrap_or_else(|| Vec::with_capacity(MAX_RTU_FRAME_SIZE));
        let deadline = Instant::now() + response_timeout;
        // a frame that started before the deadline may run a full frame past it
        let cutoff = deadline + self.line.transmit_time(MAX_RTU_FRAME_SIZE) + self.line.silence_timeout() * 2;
        let bound = cutoff + RECEIVE_GRACE;

        self.state = UartState::AwaitingResponse;
        let (done, completion) = oneshot::channel();
        let sent = self
            .commands
            .send(UartCommand::Receive { buffer, deadline, cutoff, done })
            .await;
        let result = match sent {
            Err(_) => Err(Self::driver_gone()),
            Ok(()) => match timeout_at(bound, completion).await {
                Err(_) => Ok(None),
                Ok(Err(_)) => Err(Self::driver_gone()),
                Ok(Ok(Err(e))) => Err(ModbusError::from(e)),
                Ok(Ok(Ok(frame))) => Ok(Some(frame)),
            },
        };
        self.state = UartState::Idle;

        match result? {
            Some(frame) if !frame.data.is_empty() || frame.overflow => {
                self.stats.frames_received += 1;
                self.stats.bytes_received += frame.data.len() as u64;
                self.stats.line_errors += frame.line_errors as u64;
                if frame.overflow {
                    self.stats.overflows += 1;
                }
                Ok(Some(frame))
            }
            Some(frame) => {
                self.stats.line_errors += frame.line_errors as u64;
                self.stats.timeouts += 1;
                self.rx_buffer = Some(frame.data);
                Ok(None)
            }
            None => {
                self.stats.timeouts += 1;
                Ok(None)
            }
        }
    }

    /// Give a received frame's buffer back for the next reception
    pub fn recycle(&mut self, frame: RxFrame) {
        self.rx_buffer = Some(frame.data);
    }

    /// Apply new line parameters to the port
    pub async fn reconfigure(&mut self, line: LineConfig) -> ModbusResult<()> {
        let (done, completion) = oneshot::channel();
        self.commands
            .send(UartCommand::Reconfigure { line, done })
            .await
            .map_err(|_| Self::driver_gone())?;
        completion
            .await
            .map_err(|_| Self::driver_gone())?
            .map_err(|e| ModbusError::configuration(format!("Failed to apply line settings: {}", e)))?;
        self.line = line;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{BusEventKind, SimReply, SimulatedBus};

    #[test]
    fn test_character_timing() {
        let line = LineConfig { baud_rate: 9600, parity: Parity::None, tx_delay_us: 0 };
        assert_eq!(line.frame_bits(), 10);
        assert_eq!(line.char_duration(), Duration::from_nanos(1_041_666));
        assert_eq!(line.silence_timeout(), Duration::from_nanos(1_041_666) * 7 / 2);

        let line = LineConfig { baud_rate: 9600, parity: Parity::Even, tx_delay_us: 0 };
        assert_eq!(line.frame_bits(), 11);
        assert_eq!(line.char_duration(), Duration::from_nanos(1_145_833));

        let fast = LineConfig { baud_rate: 115_200, parity: Parity::None, tx_delay_us: 250 };
        assert_eq!(fast.silence_timeout(), Duration::from_micros(1750));
        assert_eq!(fast.settle_delay(), Duration::from_micros(250));
    }

    #[test]
    fn test_parity_parsing() {
        assert_eq!("even".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("O".parse::<Parity>().unwrap(), Parity::Odd);
        assert_eq!(Parity::from_u8(0).unwrap(), Parity::None);
        assert!(Parity::from_u8(3).is_err());
        assert!("mark".parse::<Parity>().is_err());

        let from_name: Parity = serde_json::from_str("\"odd\"").unwrap();
        let from_code: Parity = serde_json::from_str("2").unwrap();
        assert_eq!(from_name, Parity::Odd);
        assert_eq!(from_code, Parity::Even);
        assert_eq!(serde_json::to_string(&Parity::None).unwrap(), "\"none\"");
    }

    #[tokio::test]
    async fn test_transmit_drives_direction_line_around_the_frame() {
        let bus = SimulatedBus::new(|_| SimReply::Silent);
        let tap = bus.clone();
        let line = LineConfig { baud_rate: 19_200, parity: Parity::None, tx_delay_us: 2000 };
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(bus, line, shutdown_rx);

        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87];
        uart.transmit(&frame).await.unwrap();
        assert_eq!(uart.state(), UartState::Idle);

        let events = tap.events();
        let on = events.iter().position(|e| e.kind == BusEventKind::DirectionOn).unwrap();
        let write = events.iter().position(|e| matches!(e.kind, BusEventKind::Write(_))).unwrap();
        let drained = events.iter().position(|e| e.kind == BusEventKind::Drained).unwrap();
        let off = events.iter().rposition(|e| e.kind == BusEventKind::DirectionOff).unwrap();
        assert!(on < write && write < drained && drained < off);

        assert!(events[write].at - events[on].at >= line.settle_delay());
        assert!(events[off].at - events[drained].at >= line.char_duration());
        assert_eq!(tap.written(), vec![frame.to_vec()]);
        assert_eq!(uart.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_receive_collects_reply_until_silence() {
        let bus = SimulatedBus::new(|request| SimReply::Respond(request.to_vec()));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(bus, LineConfig::default(), shutdown_rx);

        uart.transmit(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]).await.unwrap();
        let frame = uart.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(frame.data, vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]);
        assert!(!frame.overflow);
        assert_eq!(frame.line_errors, 0);
        uart.recycle(frame);
    }

    #[tokio::test]
    async fn test_receive_times_out_on_silent_device() {
        let bus = SimulatedBus::new(|_| SimReply::Silent);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(bus, LineConfig::default(), shutdown_rx);

        uart.transmit(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]).await.unwrap();
        let started = std::time::Instant::now();
        assert!(uart.receive(Duration::from_millis(50)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(uart.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_oversized_reply_sets_overflow() {
        let bus = SimulatedBus::new(|_| SimReply::Respond(vec![0xAA; MAX_RTU_FRAME_SIZE + 40]));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(bus, LineConfig::default(), shutdown_rx);

        uart.transmit(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]).await.unwrap();
        let frame = uart.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert!(frame.overflow);
        assert!(frame.data.len() <= MAX_RTU_FRAME_SIZE);
        assert_eq!(uart.stats().overflows, 1);
    }

    /// A line that never stops talking
    struct BabblingLine;

    #[async_trait]
    impl SerialLine for BabblingLine {
        async fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            sleep(Duration::from_micros(500)).await;
            let n = buf.len().min(16);
            buf[..n].fill(0xFF);
            Ok(n)
        }

        fn set_direction(&mut self, _transmit: bool) -> io::Result<()> {
            Ok(())
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn apply(&mut self, _line: &LineConfig) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_endless_reply_is_cut_off() {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(BabblingLine, LineConfig::default(), shutdown_rx);

        uart.transmit(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]).await.unwrap();
        let started = std::time::Instant::now();
        let frame = uart.receive(Duration::from_millis(20)).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(frame.overflow);
        uart.recycle(frame);

        // the driver is free again for the next exchange
        tokio::time::timeout(Duration::from_millis(500), uart.transmit(&[0x01]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uart.state(), UartState::Idle);
    }

    #[tokio::test]
    async fn test_line_errors_do_not_end_reception() {
        let bus = SimulatedBus::new(|request| SimReply::WithLineError(request.to_vec()));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(bus, LineConfig::default(), shutdown_rx);

        let request = [0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B];
        uart.transmit(&request).await.unwrap();
        let frame = uart.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(frame.line_errors, 1);
        assert_eq!(frame.data, request.to_vec());
    }

    #[tokio::test]
    async fn test_reconfigure_applies_to_line() {
        let bus = SimulatedBus::new(|_| SimReply::Silent);
        let tap = bus.clone();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, _driver) = spawn_uart(bus, LineConfig::default(), shutdown_rx);

        let line = LineConfig { baud_rate: 9600, parity: Parity::Even, tx_delay_us: 100 };
        uart.reconfigure(line).await.unwrap();
        assert_eq!(uart.line(), line);
        assert_eq!(tap.line(), Some(line));
    }

    #[tokio::test]
    async fn test_driver_stops_on_shutdown() {
        let bus = SimulatedBus::new(|_| SimReply::Silent);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut uart, driver) = spawn_uart(bus, LineConfig::default(), shutdown_rx);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), driver).await.unwrap().unwrap();
        assert!(uart.transmit(&[0x01]).await.is_err());
    }
}
