//! # Bridge Error Handling
//!
//! Error types for the Modbus RTU bridge, covering the TCP side (malformed
//! frames, resource exhaustion), the RTU side (timeouts, checksum and unit id
//! mismatches, receive overflows) and configuration validation.
//!
//! ## Error Categories
//!
//! ### Connection-fatal
//! - **Frame Errors**: a TCP client declared an impossible length or protocol id
//! - **I/O Errors**: the socket or serial line failed
//!
//! ### Transaction-fatal
//! - **Timeout**: the RTU device never answered
//! - **CRC / Unit Mismatch**: the RTU answer failed validation
//! - **Buffer Overflow**: the answer did not fit the receive buffer
//! - **Exception**: what the client is told when one of the above ends its
//!   transaction and gateway exceptions are enabled
//!
//! ### Non-fatal
//! - **Line errors** are counted by the transport, never raised
//! - **Configuration errors** are reported to the caller and never applied
//!
//! None of these escalate past the client or transaction that caused them:
//!
//! ```rust
//! use modbus_rtu_bridge::ModbusError;
//!
//! let err = ModbusError::crc_mismatch(0x8776, 0x1234);
//! assert!(err.is_protocol_error());
//! assert!(!err.is_connection_fatal());
//!
//! let err = ModbusError::frame("declared length 0");
//! assert!(err.is_connection_fatal());
//! ```

use thiserror::Error;

/// Result type alias for bridge operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Bridge error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or admission errors
    ///
    /// # Examples
    /// - Listener failed to bind
    /// - Serial port could not be opened
    /// - Connection cap reached
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An operation exceeded its bound
    ///
    /// # Examples
    /// - RTU response wait expired
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// General protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed Modbus TCP frame
    ///
    /// A byte stream without a trustworthy length prefix cannot be
    /// resynchronized, so this is always fatal for the connection.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The RTU answer came from a different unit than the one addressed
    #[error("Unit id mismatch: expected={expected}, actual={actual}")]
    UnitMismatch { expected: u8, actual: u8 },

    /// Received bytes did not fit the receive buffer
    #[error("Receive buffer overflow after {received} bytes")]
    BufferOverflow { received: usize },

    /// The transaction queue has no room for the entry
    #[error("Transaction queue full: {needed} bytes needed, {available} available")]
    QueueFull { needed: usize, available: usize },

    /// Configuration errors
    ///
    /// # Examples
    /// - Baud rate outside 1200-921600
    /// - Unknown parameter name
    /// - Malformed configuration file
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Modbus exception response
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    ///
    /// # Arguments
    ///
    /// * `expected` - CRC computed over the received bytes
    /// * `actual` - CRC carried by the frame
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a unit id mismatch error
    pub fn unit_mismatch(expected: u8, actual: u8) -> Self {
        Self::UnitMismatch { expected, actual }
    }

    /// Create a receive overflow error
    pub fn buffer_overflow(received: usize) -> Self {
        Self::BufferOverflow { received }
    }

    /// Create a queue full error
    pub fn queue_full(needed: usize, available: usize) -> Self {
        Self::QueueFull { needed, available }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Automatically maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (the next attempt may succeed)
    ///
    /// ```rust
    /// use modbus_rtu_bridge::ModbusError;
    ///
    /// assert!(ModbusError::timeout("rtu response", 1000).is_recoverable());
    /// assert!(ModbusError::queue_full(20, 4).is_recoverable());
    /// assert!(!ModbusError::frame("bad length").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Timeout { .. } => true,
            Self::QueueFull { .. } => true,
            Self::CrcMismatch { .. } => true,
            Self::BufferOverflow { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a network/serial transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::BufferOverflow { .. }
        )
    }

    /// Check if the error is a Modbus protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::UnitMismatch { .. }
                | Self::Exception { .. }
        )
    }

    /// Check if the error must end the TCP connection it occurred on
    ///
    /// Malformed frames cannot be resynchronized; I/O errors mean the socket
    /// is gone. RTU-side failures never qualify, they only end the transaction.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Frame { .. } | Self::Io { .. } | Self::Connection { .. })
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::timeout("rtu response", 1000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(!err.is_connection_fatal());

        let err = ModbusError::frame("declared length 0");
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());
        assert!(err.is_connection_fatal());

        let err = ModbusError::unit_mismatch(0x11, 0x12);
        assert!(err.is_protocol_error());
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x8776, 0x1234);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("8776"));
        assert!(msg.contains("1234"));

        let err = ModbusError::exception(0x03, 0x0B);
        assert!(format!("{}", err).contains("Gateway Target Device Failed to Respond"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ModbusError = io.into();
        assert!(matches!(err, ModbusError::Io { .. }));
        assert!(err.is_connection_fatal());
    }
}
