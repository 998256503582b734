//! # Modbus RTU Bridge - Modbus TCP to RS-485 Gateway
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! Exposes a Modbus-TCP server to many concurrent clients and funnels their
//! requests, one at a time, across a single half-duplex Modbus-RTU serial
//! bus. Every RTU response is routed back to the client and transaction that
//! issued it, under that transaction's original MBAP header.
//!
//! ## Features
//!
//! - **🔀 Single-flight bus arbitration**: one RTU task owns the line, requests
//!   are served strictly in arrival order
//! - **📦 Incremental framing**: per-client ring buffers tolerate any TCP
//!   segmentation, pipelined requests included
//! - **⏱️ Bounded waits everywhere**: buffer-full and frame-pending watchdogs
//!   per client, response timeout per transaction
//! - **🔌 RS-485 direction control**: settle delay before the first byte,
//!   release one character after the last
//! - **🛡️ CRC16 validation**: corrupted or misaddressed responses never reach
//!   a client
//! - **🧪 Simulated bus**: run the whole bridge without hardware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_rtu_bridge::{BridgeConfig, ModbusBridge, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = BridgeConfig::from_file("bridge.yaml")?;
//!     let mut bridge = ModbusBridge::new(config)?;
//!     bridge.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     bridge.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  TCP clients ──► per-client task ──► Framer ──┐
//!  TCP clients ──► per-client task ──► Framer ──┼──► TransactionQueue
//!                        ▲                      │          │
//!                        │                      │          ▼
//!                 ClientRegistry ◄── response ──┘      RTU task
//!                                                          │
//!                                                   UartTransport
//!                                                          │
//!                                                    UART driver ──► RS-485
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus CRC16
pub mod crc;

/// MBAP header codec, sessions and RTU frames
pub mod protocol;

/// Fixed-capacity byte ring
pub mod ring;

/// Per-client Modbus-TCP frame assembly
pub mod framer;

/// Multi-producer transaction queue feeding the RTU task
pub mod queue;

/// UART transport: line timing, driver task and its handle
pub mod transport;

/// In-memory RS-485 bus for tests and demo mode
pub mod simulator;

/// The RTU task
pub mod rtu;

/// TCP connection manager and client registry
pub mod server;

/// Configuration file and runtime configuration provider
pub mod config;

/// Bridge assembly
pub mod bridge;

/// Utility functions and statistics
pub mod utils;

/// Packet logging and logger setup
pub mod logging;

// Re-export main types for convenience
pub use bridge::ModbusBridge;
pub use config::{BridgeConfig, ConfigProvider, ParameterId, ParameterValue};
pub use error::{ModbusError, ModbusResult};
pub use framer::{Framer, FramerState};
pub use logging::{LogLevel, LoggingMode, PacketLogger};
pub use protocol::{FrameHeader, ModbusException, Session};
pub use queue::TransactionQueue;
pub use rtu::{ResponseSink, RtuSettings, RtuWorker};
pub use server::{ClientHandle, ClientRegistry, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig};
pub use simulator::{SimReply, SimulatedBus};
pub use transport::{LineConfig, Parity, SerialLine, SerialPortLine, UartTransport};
pub use utils::{BridgeStats, StatsSnapshot};

/// MBAP header size (transaction id, protocol id, length, unit id)
pub const MBAP_HEADER_SIZE: usize = 7;

/// MBAP bytes up to and including the length field
pub const MBAP_LENGTH_PREFIX: usize = 6;

/// Maximum Modbus PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// Largest MBAP length field: unit id plus a maximum PDU
pub const MAX_MBAP_LENGTH: usize = 254;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Unit id addressing every device on the bus; never answered
pub const BROADCAST_UNIT_ID: u8 = 0;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus RTU Bridge v{} - Modbus TCP to RS-485 gateway by Evan Liu", VERSION)
}
