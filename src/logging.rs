//! Packet logging for the bridge
//!
//! Every frame crossing the bridge can be dumped as raw hex, decoded into its
//! MBAP/RTU fields, or both. Output goes through `tracing` by default, or to a
//! callback when one is installed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::crc;
use crate::protocol::FrameHeader;
use crate::utils::format::bytes_to_hex;
use crate::MBAP_HEADER_SIZE;

/// Log levels accepted in the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show decoded header fields
    #[default]
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

/// Where a logged frame sits in the request/response path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    TcpRequest,
    RtuRequest,
    RtuResponse,
    TcpResponse,
}

impl PacketDirection {
    fn is_tcp(self) -> bool {
        matches!(self, PacketDirection::TcpRequest | PacketDirection::TcpResponse)
    }

    fn arrow(self) -> &'static str {
        match self {
            PacketDirection::TcpRequest | PacketDirection::RtuResponse => "<-",
            PacketDirection::RtuRequest | PacketDirection::TcpResponse => "->",
        }
    }
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketDirection::TcpRequest => "TCP request",
            PacketDirection::RtuRequest => "RTU request",
            PacketDirection::RtuResponse => "RTU response",
            PacketDirection::TcpResponse => "TCP response",
        };
        f.write_str(name)
    }
}

/// Type alias for packet log callbacks
///
/// The callback receives the direction and the formatted line.
pub type PacketCallback = Arc<dyn Fn(PacketDirection, &str) + Send + Sync>;

/// Frame dumper shared by the client handlers and the RTU task
#[derive(Clone, Default)]
pub struct PacketLogger {
    enabled: bool,
    mode: LoggingMode,
    callback: Option<PacketCallback>,
}

impl fmt::Debug for PacketLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketLogger")
            .field("enabled", &self.enabled)
            .field("mode", &self.mode)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl PacketLogger {
    pub fn new(enabled: bool, mode: LoggingMode) -> Self {
        Self { enabled, mode, callback: None }
    }

    /// Logger that outputs nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Route output to `callback` instead of `tracing`
    pub fn with_callback(mut self, callback: PacketCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log one frame as it crosses the bridge
    pub fn log(&self, direction: PacketDirection, frame: &[u8]) {
        if !self.enabled {
            return;
        }

        match self.mode {
            LoggingMode::Raw => self.emit(direction, &Self::raw_line(direction, frame), false),
            LoggingMode::Interpreted => self.emit(direction, &Self::interpreted_line(direction, frame), false),
            LoggingMode::Both => {
                self.emit(direction, &Self::interpreted_line(direction, frame), false);
                self.emit(direction, &Self::raw_line(direction, frame), true);
            }
        }
    }

    fn emit(&self, direction: PacketDirection, line: &str, detail: bool) {
        match &self.callback {
            Some(callback) => callback(direction, line),
            None if detail => debug!("{}", line),
            None => info!("{}", line),
        }
    }

    fn raw_line(direction: PacketDirection, frame: &[u8]) -> String {
        let protocol = if direction.is_tcp() { "TCP" } else { "RTU" };
        format!(
            "[MODBUS-{}] {} {} ({} bytes): {}",
            protocol,
            direction.arrow(),
            direction,
            frame.len(),
            bytes_to_hex(frame)
        )
    }

    fn interpreted_line(direction: PacketDirection, frame: &[u8]) -> String {
        if direction.is_tcp() {
            if frame.len() < MBAP_HEADER_SIZE {
                return format!("{} {}: truncated ({} bytes)", direction.arrow(), direction, frame.len());
            }
            let mut head = [0u8; MBAP_HEADER_SIZE];
            head.copy_from_slice(&frame[..MBAP_HEADER_SIZE]);
            let header = FrameHeader::decode(&head);
            let function = frame.get(MBAP_HEADER_SIZE).copied().unwrap_or(0);
            format!(
                "{} {}: tid={} pid={} len={} unit={} function={} (0x{:02X})",
                direction.arrow(),
                direction,
                header.transaction_id,
                header.protocol_id,
                header.length,
                header.unit_id,
                function_name(function),
                function
            )
        } else {
            if frame.len() < 2 {
                return format!("{} {}: truncated ({} bytes)", direction.arrow(), direction, frame.len());
            }
            format!(
                "{} {}: unit={} function={} (0x{:02X}) data={} bytes crc={}",
                direction.arrow(),
                direction,
                frame[0],
                function_name(frame[1]),
                frame[1],
                frame.len().saturating_sub(4),
                if crc::check(frame) { "ok" } else { "BAD" }
            )
        }
    }
}

/// Human-readable function name, for log output only
pub fn function_name(function_code: u8) -> &'static str {
    if function_code & 0x80 != 0 {
        return "Exception";
    }
    match function_code {
        0x01 => "Read Coils",
        0x02 => "Read Discrete Inputs",
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x05 => "Write Single Coil",
        0x06 => "Write Single Register",
        0x0F => "Write Multiple Coils",
        0x10 => "Write Multiple Registers",
        0x17 => "Read/Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// Initialise `env_logger` at `level`; `RUST_LOG` overrides it
pub fn init_logger(level: LogLevel) {
    let env = env_logger::Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
