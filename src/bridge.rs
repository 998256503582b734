//! Bridge assembly
//!
//! `ModbusBridge` owns every long-lived piece of a running bridge: the
//! transaction queue, the client registry, the UART driver, the RTU task and
//! the TCP listeners. They share one broadcast shutdown signal.

use futures::future::join_all;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::{BridgeConfig, ConfigProvider};
use crate::error::{ModbusError, ModbusResult};
use crate::queue::TransactionQueue;
use crate::rtu::RtuWorker;
use crate::server::{ClientInfo, ClientRegistry, ModbusServer, ModbusTcpServer};
use crate::simulator::SimulatedBus;
use crate::transport::{spawn_uart, LineConfig, SerialLine, SerialPortLine};
use crate::utils::{BridgeStats, StatsSnapshot};

pub struct ModbusBridge {
    config: BridgeConfig,
    queue: Arc<TransactionQueue>,
    registry: Arc<ClientRegistry>,
    stats: Arc<BridgeStats>,
    /// Config mutex shared by the RTU task and the configuration provider
    line: Arc<Mutex<LineConfig>>,
    server: ModbusTcpServer,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ModbusBridge {
    /// Validate `config` and build the shared state; nothing runs yet
    pub fn new(config: BridgeConfig) -> ModbusResult<Self> {
        config.validate()?;

        let queue = Arc::new(TransactionQueue::new(config.rtu.queue_capacity));
        let registry = Arc::new(ClientRegistry::new(config.server.max_connections));
        let stats = Arc::new(BridgeStats::new());
        let line = Arc::new(Mutex::new(config.line_config()));
        let server = ModbusTcpServer::new(config.server_config(), queue.clone(), registry.clone(), stats.clone())
            .with_packet_logger(config.packet_logger());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queue,
            registry,
            stats,
            line,
            server,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Open the configured serial port (or the echo simulator) and start
    pub async fn start(&mut self) -> ModbusResult<()> {
        if self.config.serial.is_simulator() {
            warn!("🧪 Running against the simulated echo bus, no serial port is used");
            return self.start_with_line(SimulatedBus::echo()).await;
        }

        let line = self.config.line_config();
        let port = SerialPortLine::open(&self.config.serial.port, &line, self.config.serial.direction_active_low)?;
        info!(
            "🔌 Opened {} at {} baud, parity {}, tx delay {}µs",
            self.config.serial.port, line.baud_rate, line.parity, line.tx_delay_us
        );
        self.start_with_line(port).await
    }

    /// Start on an already opened line
    pub async fn start_with_line<L: SerialLine>(&mut self, line_io: L) -> ModbusResult<()> {
        if self.is_running() {
            return Err(ModbusError::protocol("Bridge is already running"));
        }

        let line = *self.line.lock().await;
        let (uart, driver) = spawn_uart(line_io, line, self.shutdown_tx.subscribe());
        self.tasks.push(driver);

        let worker = RtuWorker::new(
            self.queue.clone(),
            uart,
            self.line.clone(),
            self.registry.clone(),
            self.config.rtu_settings(),
            self.stats.clone(),
        )
        .with_packet_logger(self.config.packet_logger());
        self.tasks.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));

        if let Err(e) = self.server.start().await {
            let _ = self.shutdown_tx.send(());
            join_all(self.tasks.drain(..)).await;
            return Err(e);
        }

        info!("✅ Modbus bridge started");
        Ok(())
    }

    /// Stop listeners, client handlers, the RTU task and the UART driver
    pub async fn stop(&mut self) -> ModbusResult<()> {
        self.server.stop().await?;
        let _ = self.shutdown_tx.send(());
        join_all(self.tasks.drain(..)).await;
        info!("⏹️  Modbus bridge stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        self.server.local_addrs()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Connected clients in slot order
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.registry.clients()
    }

    /// Requests waiting for the RTU task
    pub fn queued_transactions(&self) -> usize {
        self.queue.len()
    }

    /// Ring bytes held by waiting requests
    pub fn queued_bytes(&self) -> usize {
        self.queue.capacity() - self.queue.vacancy()
    }

    pub fn config_provider(&self) -> ConfigProvider {
        ConfigProvider::new(self.line.clone())
    }
}
