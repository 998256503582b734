//! Bridge configuration
//!
//! Two layers live here:
//!
//! - [`BridgeConfig`], the startup configuration read from a YAML or JSON
//!   file. Every field has a default, so an empty file is a valid config.
//! - [`ConfigProvider`], the runtime parameter surface used by a management
//!   plane. It reads and changes the live serial line parameters through the
//!   same mutex the RTU task holds for each transaction, so a change never
//!   lands in the middle of a frame.
//!
//! ```yaml
//! server:
//!   bind_addresses: ["0.0.0.0:502", "[::]:502"]
//!   max_connections: 8
//! serial:
//!   port: /dev/ttyUSB0
//!   baud_rate: 19200
//!   parity: even
//!   tx_delay_us: 50
//! rtu:
//!   response_timeout_ms: 500
//! logging:
//!   level: debug
//!   packet_logging: true
//!   mode: both
//! ```

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::{LogLevel, LoggingMode, PacketLogger};
use crate::rtu::RtuSettings;
use crate::server::ModbusTcpServerConfig;
use crate::transport::{LineConfig, Parity};
use crate::{queue::TransactionQueue, MAX_PDU_SIZE, MAX_TCP_FRAME_SIZE};

/// Baud rates accepted on the line
pub const MIN_BAUD_RATE: u32 = 1200;
pub const MAX_BAUD_RATE: u32 = 921_600;
/// Longest direction-enable settle delay, in microseconds
pub const MAX_TX_DELAY_US: u32 = 10_000;

/// Serial port name that selects the in-memory echo bus
pub const SIMULATOR_PORT: &str = "simulator";

/// Complete bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerSection,
    pub serial: SerialSection,
    pub rtu: RtuSection,
    pub logging: LoggingSection,
}

/// TCP side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// One listener per address
    pub bind_addresses: Vec<SocketAddr>,
    pub max_connections: usize,
    /// Per-client receive buffer, bytes
    pub client_buffer_size: usize,
    pub buffer_full_timeout_ms: u64,
    pub frame_pending_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub outbound_queue_depth: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ModbusTcpServerConfig::default();
        Self {
            bind_addresses: defaults.bind_addresses,
            max_connections: defaults.max_connections,
            client_buffer_size: defaults.client_buffer_size,
            buffer_full_timeout_ms: defaults.buffer_full_timeout.as_millis() as u64,
            frame_pending_timeout_ms: defaults.frame_pending_timeout.as_millis() as u64,
            write_timeout_ms: defaults.write_timeout.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            outbound_queue_depth: defaults.outbound_queue_depth,
        }
    }
}

/// RS-485 side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Device path, or `simulator`
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub tx_delay_us: u32,
    /// Direction-enable asserted by driving RTS low
    pub direction_active_low: bool,
}

impl Default for SerialSection {
    fn default() -> Self {
        let line = LineConfig::default();
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: line.baud_rate,
            parity: line.parity,
            tx_delay_us: line.tx_delay_us,
            direction_active_low: false,
        }
    }
}

impl SerialSection {
    pub fn is_simulator(&self) -> bool {
        self.port == SIMULATOR_PORT
    }
}

/// RTU task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtuSection {
    pub response_timeout_ms: u64,
    /// Transaction queue size, bytes
    pub queue_capacity: usize,
    /// Answer failed transactions with a gateway exception
    pub exception_on_failure: bool,
}

impl Default for RtuSection {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            queue_capacity: 2048,
            exception_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub packet_logging: bool,
    pub mode: LoggingMode,
}

impl BridgeConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e)))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let config = match extension.as_deref() {
            Some("json") => Self::from_json_str(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            _ => {
                return Err(ModbusError::configuration(format!(
                    "Unsupported config file type: {}",
                    path.display()
                )))
            }
        };

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> ModbusResult<Self> {
        // serde_yaml rejects an empty document; treat it as all defaults
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every bound before anything is started
    pub fn validate(&self) -> ModbusResult<()> {
        let server = &self.server;
        if server.bind_addresses.is_empty() {
            return Err(ModbusError::configuration("server.bind_addresses is empty"));
        }
        if server.max_connections == 0 {
            return Err(ModbusError::configuration("server.max_connections must be at least 1"));
        }
        if server.client_buffer_size < MAX_TCP_FRAME_SIZE {
            return Err(ModbusError::configuration(format!(
                "server.client_buffer_size {} cannot hold a {}-byte frame",
                server.client_buffer_size, MAX_TCP_FRAME_SIZE
            )));
        }
        if server.buffer_full_timeout_ms == 0
            || server.frame_pending_timeout_ms == 0
            || server.write_timeout_ms == 0
        {
            return Err(ModbusError::configuration("server timeouts must be non-zero"));
        }
        if server.poll_interval_ms == 0 {
            return Err(ModbusError::configuration("server.poll_interval_ms must be non-zero"));
        }
        if server.outbound_queue_depth == 0 {
            return Err(ModbusError::configuration("server.outbound_queue_depth must be at least 1"));
        }

        if self.serial.port.trim().is_empty() {
            return Err(ModbusError::configuration("serial.port is empty"));
        }
        validate_baud_rate(self.serial.baud_rate)?;
        validate_tx_delay(self.serial.tx_delay_us)?;

        if self.rtu.response_timeout_ms == 0 {
            return Err(ModbusError::configuration("rtu.response_timeout_ms must be non-zero"));
        }
        let largest_entry = TransactionQueue::entry_len(MAX_PDU_SIZE);
        if self.rtu.queue_capacity < largest_entry {
            return Err(ModbusError::configuration(format!(
                "rtu.queue_capacity {} cannot hold one {}-byte entry",
                self.rtu.queue_capacity, largest_entry
            )));
        }
        Ok(())
    }

    pub fn line_config(&self) -> LineConfig {
        LineConfig {
            baud_rate: self.serial.baud_rate,
            parity: self.serial.parity,
            tx_delay_us: self.serial.tx_delay_us,
        }
    }

    pub fn server_config(&self) -> ModbusTcpServerConfig {
        let server = &self.server;
        ModbusTcpServerConfig {
            bind_addresses: server.bind_addresses.clone(),
            max_connections: server.max_connections,
            client_buffer_size: server.client_buffer_size,
            buffer_full_timeout: Duration::from_millis(server.buffer_full_timeout_ms),
            frame_pending_timeout: Duration::from_millis(server.frame_pending_timeout_ms),
            write_timeout: Duration::from_millis(server.write_timeout_ms),
            poll_interval: Duration::from_millis(server.poll_interval_ms),
            outbound_queue_depth: server.outbound_queue_depth,
        }
    }

    pub fn rtu_settings(&self) -> RtuSettings {
        RtuSettings {
            response_timeout: Duration::from_millis(self.rtu.response_timeout_ms),
            exception_on_failure: self.rtu.exception_on_failure,
        }
    }

    pub fn packet_logger(&self) -> PacketLogger {
        PacketLogger::new(self.logging.packet_logging, self.logging.mode)
    }
}

fn validate_baud_rate(baud_rate: u32) -> ModbusResult<()> {
    if !(MIN_BAUD_RATE..=MAX_BAUD_RATE).contains(&baud_rate) {
        return Err(ModbusError::configuration(format!(
            "Baud rate {} outside {}..={}",
            baud_rate, MIN_BAUD_RATE, MAX_BAUD_RATE
        )));
    }
    Ok(())
}

fn validate_tx_delay(tx_delay_us: u32) -> ModbusResult<()> {
    if tx_delay_us > MAX_TX_DELAY_US {
        return Err(ModbusError::configuration(format!(
            "Transmit delay {}µs exceeds {}µs",
            tx_delay_us, MAX_TX_DELAY_US
        )));
    }
    Ok(())
}

/// Runtime-adjustable line parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterId {
    BaudRate,
    Parity,
    TxDelay,
}

/// A parameter together with its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParameterValue {
    BaudRate(u32),
    Parity(Parity),
    TxDelay(u32),
}

impl ParameterValue {
    pub fn id(&self) -> ParameterId {
        match self {
            ParameterValue::BaudRate(_) => ParameterId::BaudRate,
            ParameterValue::Parity(_) => ParameterId::Parity,
            ParameterValue::TxDelay(_) => ParameterId::TxDelay,
        }
    }

    fn read(id: ParameterId, line: &LineConfig) -> Self {
        match id {
            ParameterId::BaudRate => ParameterValue::BaudRate(line.baud_rate),
            ParameterId::Parity => ParameterValue::Parity(line.parity),
            ParameterId::TxDelay => ParameterValue::TxDelay(line.tx_delay_us),
        }
    }

    fn write(self, line: &mut LineConfig) {
        match self {
            ParameterValue::BaudRate(baud_rate) => line.baud_rate = baud_rate,
            ParameterValue::Parity(parity) => line.parity = parity,
            ParameterValue::TxDelay(tx_delay_us) => line.tx_delay_us = tx_delay_us,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::BaudRate(baud_rate) => write!(f, "{}", baud_rate),
            ParameterValue::Parity(parity) => write!(f, "{}", parity.to_u8()),
            ParameterValue::TxDelay(tx_delay_us) => write!(f, "{}", tx_delay_us),
        }
    }
}

/// Name, parser and validation predicate of one parameter
struct ParameterSpec {
    id: ParameterId,
    name: &'static str,
    parse: fn(&str) -> ModbusResult<ParameterValue>,
    validate: fn(&ParameterValue) -> ModbusResult<()>,
}

fn parse_u32(name: &str, raw: &str) -> ModbusResult<u32> {
    raw.trim()
        .parse()
        .map_err(|_| ModbusError::configuration(format!("{} expects an unsigned integer, got '{}'", name, raw)))
}

fn parse_baud_rate(raw: &str) -> ModbusResult<ParameterValue> {
    parse_u32("uart_baud", raw).map(ParameterValue::BaudRate)
}

fn parse_parity(raw: &str) -> ModbusResult<ParameterValue> {
    raw.parse().map(ParameterValue::Parity)
}

fn parse_tx_delay(raw: &str) -> ModbusResult<ParameterValue> {
    parse_u32("uart_tx_delay", raw).map(ParameterValue::TxDelay)
}

fn check_value(value: &ParameterValue) -> ModbusResult<()> {
    match value {
        ParameterValue::BaudRate(baud_rate) => validate_baud_rate(*baud_rate),
        // every Parity variant is a legal setting
        ParameterValue::Parity(_) => Ok(()),
        ParameterValue::TxDelay(tx_delay_us) => validate_tx_delay(*tx_delay_us),
    }
}

static PARAMETERS: [ParameterSpec; 3] = [
    ParameterSpec {
        id: ParameterId::BaudRate,
        name: "uart_baud",
        parse: parse_baud_rate,
        validate: check_value,
    },
    ParameterSpec {
        id: ParameterId::Parity,
        name: "uart_parity",
        parse: parse_parity,
        validate: check_value,
    },
    ParameterSpec {
        id: ParameterId::TxDelay,
        name: "uart_tx_delay",
        parse: parse_tx_delay,
        validate: check_value,
    },
];

fn parameter(id: ParameterId) -> &'static ParameterSpec {
    match id {
        ParameterId::BaudRate => &PARAMETERS[0],
        ParameterId::Parity => &PARAMETERS[1],
        ParameterId::TxDelay => &PARAMETERS[2],
    }
}

impl ParameterId {
    /// Every parameter, in table order
    pub fn all() -> impl Iterator<Item = ParameterId> {
        PARAMETERS.iter().map(|entry| entry.id)
    }

    pub fn name(self) -> &'static str {
        parameter(self).name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        PARAMETERS.iter().find(|entry| entry.name == name).map(|entry| entry.id)
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime access to the live line parameters
///
/// Every call takes the config mutex, so it waits for an in-flight RTU
/// transaction to finish. New values reach the port at the start of the next
/// transaction.
#[derive(Debug, Clone)]
pub struct ConfigProvider {
    line: Arc<Mutex<LineConfig>>,
}

impl ConfigProvider {
    pub fn new(line: Arc<Mutex<LineConfig>>) -> Self {
        Self { line }
    }

    pub fn id_from_name(name: &str) -> ModbusResult<ParameterId> {
        ParameterId::from_name(name)
            .ok_or_else(|| ModbusError::configuration(format!("Unknown parameter '{}'", name)))
    }

    pub async fn get(&self, id: ParameterId) -> ParameterValue {
        ParameterValue::read(id, &*self.line.lock().await)
    }

    /// Validate and apply; an invalid value leaves the line untouched
    pub async fn set(&self, value: ParameterValue) -> ModbusResult<()> {
        (parameter(value.id()).validate)(&value)?;
        let mut line = self.line.lock().await;
        value.write(&mut line);
        info!("Set {} to {}", value.id(), value);
        Ok(())
    }

    /// Parse `raw` as the value of parameter `name`, then [`set`](Self::set) it
    pub async fn set_from_raw(&self, name: &str, raw: &str) -> ModbusResult<ParameterValue> {
        let id = Self::id_from_name(name)?;
        let value = (parameter(id).parse)(raw)?;
        self.set(value).await?;
        Ok(value)
    }

    /// Value as text, in the form `set_from_raw` accepts
    pub async fn get_readable(&self, id: ParameterId) -> String {
        self.get(id).await.to_string()
    }

    /// Current line parameters
    pub async fn snapshot(&self) -> LineConfig {
        *self.line.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.rtu.response_timeout_ms, 1000);
        assert!(!config.rtu.exception_on_failure);
        assert!(!config.logging.packet_logging);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
server:
  bind_addresses: ["127.0.0.1:1502", "[::1]:1502"]
  write_timeout_ms: 750
serial:
  port: simulator
  baud_rate: 9600
  parity: 2
rtu:
  exception_on_failure: true
logging:
  mode: raw
"#;
        let config = BridgeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.server.bind_addresses.len(), 2);
        assert_eq!(config.server.max_connections, 8);
        assert!(config.serial.is_simulator());
        assert_eq!(config.serial.parity, Parity::Even);
        assert!(config.rtu.exception_on_failure);
        assert_eq!(config.logging.mode, LoggingMode::Raw);

        let line = config.line_config();
        assert_eq!(line.baud_rate, 9600);
        assert_eq!(config.server_config().bind_addresses[1].port(), 1502);
        assert_eq!(config.server_config().write_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_json_and_empty_documents() {
        let config = BridgeConfig::from_json_str(r#"{"serial": {"parity": "odd"}}"#).unwrap();
        assert_eq!(config.serial.parity, Parity::Odd);
        assert_eq!(BridgeConfig::from_yaml_str("  \n").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let yaml = "serial:\n  baud_rate: 300\n";
        assert!(matches!(
            BridgeConfig::from_yaml_str(yaml),
            Err(ModbusError::Configuration { .. })
        ));

        let mut config = BridgeConfig::default();
        config.server.client_buffer_size = 100;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.rtu.queue_capacity = 64;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.serial.tx_delay_us = MAX_TX_DELAY_US + 1;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.server.write_timeout_ms = 0;
        assert!(config.validate().is_err());

        assert!(BridgeConfig::from_yaml_str("serial:\n  parity: 7\n").is_err());
    }

    #[test]
    fn test_unknown_extension() {
        let path = std::env::temp_dir().join("modbus_rtu_bridge_config_test.toml");
        std::fs::write(&path, "x = 1").unwrap();
        assert!(BridgeConfig::from_file(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_parameter_table() {
        assert_eq!(ParameterId::all().count(), 3);
        for id in ParameterId::all() {
            assert_eq!(ParameterId::from_name(id.name()), Some(id));
        }
        assert_eq!(ConfigProvider::id_from_name("uart_parity").unwrap(), ParameterId::Parity);
        assert!(ConfigProvider::id_from_name("wifi_ssid").is_err());
    }

    #[tokio::test]
    async fn test_provider_set_and_get() {
        let line = Arc::new(Mutex::new(LineConfig::default()));
        let provider = ConfigProvider::new(line.clone());

        provider.set(ParameterValue::BaudRate(9600)).await.unwrap();
        assert_eq!(provider.get(ParameterId::BaudRate).await, ParameterValue::BaudRate(9600));
        assert_eq!(line.lock().await.baud_rate, 9600);

        let value = provider.set_from_raw("uart_parity", "1").await.unwrap();
        assert_eq!(value, ParameterValue::Parity(Parity::Odd));
        assert_eq!(provider.get_readable(ParameterId::Parity).await, "1");

        provider.set_from_raw("uart_tx_delay", "250").await.unwrap();
        assert_eq!(provider.snapshot().await.tx_delay_us, 250);
    }

    #[tokio::test]
    async fn test_provider_rejects_without_applying() {
        let provider = ConfigProvider::new(Arc::new(Mutex::new(LineConfig::default())));

        assert!(provider.set(ParameterValue::BaudRate(1_000_000)).await.is_err());
        assert!(provider.set(ParameterValue::BaudRate(1199)).await.is_err());
        assert!(provider.set_from_raw("uart_baud", "fast").await.is_err());
        assert!(provider.set_from_raw("uart_parity", "3").await.is_err());
        assert!(provider.set_from_raw("uart_tx_delay", "10001").await.is_err());

        assert_eq!(provider.snapshot().await, LineConfig::default());
    }

    #[tokio::test]
    async fn test_provider_waits_for_config_mutex() {
        let line = Arc::new(Mutex::new(LineConfig::default()));
        let provider = ConfigProvider::new(line.clone());

        let guard = line.lock().await;
        let pending = tokio::spawn({
            let provider = provider.clone();
            async move { provider.set(ParameterValue::BaudRate(19200)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(guard.baud_rate, 115_200);
        drop(guard);

        pending.await.unwrap().unwrap();
        assert_eq!(provider.snapshot().await.baud_rate, 19200);
    }
}
