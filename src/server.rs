//! Modbus TCP connection manager
//!
//! Accepts TCP clients (up to a fixed cap), assembles their Modbus-TCP
//! frames, pushes complete requests into the RTU transaction queue and writes
//! the responses the RTU task hands back. Each client runs in its own task;
//! clients are tracked in a slot arena addressed by generation-tagged
//! handles, so a response for a client that left can never reach a newcomer
//! that took over its slot.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::error::{ModbusError, ModbusResult};
use crate::framer::Framer;
use crate::logging::{PacketDirection, PacketLogger};
use crate::protocol::Session;
use crate::queue::TransactionQueue;
use crate::rtu::ResponseSink;
use crate::utils::{BridgeStats, StatsSnapshot};

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> StatsSnapshot;
}

/// Stable identity of one connected client
///
/// The generation changes every time a slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle {
    index: u32,
    generation: u32,
}

impl ClientHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}.{}", self.index, self.generation)
    }
}

/// Active client, as reported to the management plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub slot: u32,
    pub generation: u32,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Occupant {
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Bytes>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupant: Option<Occupant>,
}

/// Arena of client slots
///
/// Doubles as the response sink for the RTU task: delivery looks the handle
/// up and pushes the frame onto that client's outbound channel without
/// waiting.
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Mutex<Vec<Slot>>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_clients)),
            max_clients,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Take the lowest free slot, or `None` when the cap is reached
    pub fn register(&self, peer: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Option<ClientHandle> {
        let mut slots = self.slots();
        let occupant = Occupant {
            peer,
            connected_at: Utc::now(),
            outbound,
        };

        if let Some(index) = slots.iter().position(|slot| slot.occupant.is_none()) {
            let slot = &mut slots[index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.occupant = Some(occupant);
            return Some(ClientHandle::new(index as u32, slot.generation));
        }

        if slots.len() >= self.max_clients {
            return None;
        }
        slots.push(Slot {
            generation: 0,
            occupant: Some(occupant),
        });
        Some(ClientHandle::new((slots.len() - 1) as u32, 0))
    }

    /// Free the client's slot; stale handles are ignored
    pub fn release(&self, handle: ClientHandle) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.occupant.is_some() => {
                slot.occupant = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, handle: ClientHandle) -> bool {
        self.slots()
            .get(handle.index as usize)
            .map_or(false, |slot| slot.generation == handle.generation && slot.occupant.is_some())
    }

    /// Connected clients
    pub fn count(&self) -> usize {
        self.slots().iter().filter(|slot| slot.occupant.is_some()).count()
    }

    /// Connected clients in slot order
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.occupant.as_ref().map(|occupant| ClientInfo {
                    slot: index as u32,
                    generation: slot.generation,
                    peer: occupant.peer,
                    connected_at: occupant.connected_at,
                })
            })
            .collect()
    }
}

impl ResponseSink for ClientRegistry {
    fn deliver(&self, client: ClientHandle, frame: Bytes) -> bool {
        let slots = self.slots();
        match slots.get(client.index as usize) {
            Some(Slot { generation, occupant: Some(occupant) }) if *generation == client.generation => {
                occupant.outbound.try_send(frame).is_ok()
            }
            _ => false,
        }
    }
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    /// One listener per address
    pub bind_addresses: Vec<SocketAddr>,
    pub max_connections: usize,
    /// Per-client receive ring size
    pub client_buffer_size: usize,
    /// Eviction bound while the receive ring is full or holds an
    /// incomplete frame
    pub buffer_full_timeout: Duration,
    /// Eviction bound while a complete frame waits for queue space
    pub frame_pending_timeout: Duration,
    /// Bound on writing one response (and on the final socket shutdown)
    pub write_timeout: Duration,
    /// Longest a client handler sleeps before re-checking its timers
    pub poll_interval: Duration,
    /// Responses buffered per client before delivery fails
    pub outbound_queue_depth: usize,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addresses: vec![SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_TCP_PORT))],
            max_connections: 8,
            client_buffer_size: 512,
            buffer_full_timeout: Duration::from_secs(3),
            frame_pending_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
            outbound_queue_depth: 8,
        }
    }
}

/// Why a client handler ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    Io(String),
    MalformedFrame(ModbusError),
    BufferFullTimeout,
    FramePendingTimeout,
    /// The peer stopped reading its responses
    WriteTimeout,
    Shutdown,
}

impl DisconnectReason {
    /// Whether the bridge, not the peer, ended the connection
    pub fn is_eviction(&self) -> bool {
        matches!(
            self,
            DisconnectReason::MalformedFrame(_)
                | DisconnectReason::BufferFullTimeout
                | DisconnectReason::FramePendingTimeout
                | DisconnectReason::WriteTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => f.write_str("peer closed"),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::MalformedFrame(e) => write!(f, "malformed frame: {}", e),
            DisconnectReason::BufferFullTimeout => f.write_str("buffer-full timeout"),
            DisconnectReason::FramePendingTimeout => f.write_str("frame-pending timeout"),
            DisconnectReason::WriteTimeout => f.write_str("write timeout"),
            DisconnectReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Everything a client handler needs besides its stream
#[derive(Clone)]
pub struct ClientContext {
    pub handle: ClientHandle,
    pub peer: SocketAddr,
    pub queue: Arc<TransactionQueue>,
    pub registry: Arc<ClientRegistry>,
    pub stats: Arc<BridgeStats>,
    pub packets: PacketLogger,
    pub config: Arc<ModbusTcpServerConfig>,
}

/// Arms on the first check that sees its condition and fires once the
/// condition has held for the bound
#[derive(Debug, Default)]
struct Watchdog {
    since: Option<Instant>,
}

impl Watchdog {
    fn check(&mut self, condition: bool, bound: Duration, now: Instant) -> bool {
        if !condition {
            self.since = None;
            return false;
        }
        let since = *self.since.get_or_insert(now);
        now.duration_since(since) >= bound
    }

    fn reset(&mut self) {
        self.since = None;
    }
}

/// Serve one client until it leaves, misbehaves or the server stops
///
/// Releases the client's registry slot before returning.
pub async fn handle_client<T>(
    stream: T,
    ctx: ClientContext,
    mut outbound: mpsc::Receiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) -> DisconnectReason
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = Framer::new(ctx.config.client_buffer_size);
    let mut buffer_full = Watchdog::default();
    let mut frame_pending = Watchdog::default();
    let mut ticker = tokio::time::interval(ctx.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        // armed before the hand-off so a slot freed in between still wakes us
        let space = ctx.queue.space_available();
        tokio::pin!(space);
        space.as_mut().enable();

        match hand_off(&mut framer, &ctx) {
            Ok(0) => {}
            Ok(_) => {
                buffer_full.reset();
                frame_pending.reset();
            }
            Err(e) => {
                BridgeStats::incr(&ctx.stats.malformed_frames);
                break DisconnectReason::MalformedFrame(e);
            }
        }

        let now = Instant::now();
        if frame_pending.check(framer.state().is_ready(), ctx.config.frame_pending_timeout, now) {
            break DisconnectReason::FramePendingTimeout;
        }
        let stalled = framer.vacancy() == 0 || framer.holds_partial_frame();
        if buffer_full.check(stalled, ctx.config.buffer_full_timeout, now) {
            break DisconnectReason::BufferFullTimeout;
        }

        tokio::select! {
            _ = shutdown.recv() => break DisconnectReason::Shutdown,

            read = reader.read(framer.recv_span()), if framer.vacancy() > 0 => {
                match read {
                    Ok(0) => break DisconnectReason::PeerClosed,
                    Ok(n) => {
                        BridgeStats::add(&ctx.stats.bytes_from_clients, n as u64);
                        if let Err(e) = framer.on_bytes_received(n) {
                            BridgeStats::incr(&ctx.stats.malformed_frames);
                            break DisconnectReason::MalformedFrame(e);
                        }
                    }
                    Err(e) => break DisconnectReason::Io(e.to_string()),
                }
            }

            Some(response) = outbound.recv() => {
                tokio::select! {
                    _ = shutdown.recv() => break DisconnectReason::Shutdown,
                    written = timeout(ctx.config.write_timeout, writer.write_all(&response)) => {
                        match written {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break DisconnectReason::Io(e.to_string()),
                            Err(_) => break DisconnectReason::WriteTimeout,
                        }
                    }
                }
            }

            _ = space.as_mut(), if framer.state().is_ready() => {}

            _ = ticker.tick() => {}
        }
    };

    ctx.registry.release(ctx.handle);
    if timeout(ctx.config.write_timeout, writer.shutdown()).await.is_err() {
        debug!("{} ({}) socket shutdown timed out", ctx.handle, ctx.peer);
    }

    if reason.is_eviction() {
        BridgeStats::incr(&ctx.stats.connections_evicted);
        warn!("⛔ {} ({}) evicted: {}", ctx.handle, ctx.peer, reason);
    } else {
        info!("🔌 {} ({}) disconnected: {}", ctx.handle, ctx.peer, reason);
    }
    reason
}

/// Push every ready frame into the transaction queue, returning how many
/// went in
///
/// Stops at the first frame the queue cannot take; it stays ready in the
/// framer and is retried on the next pass.
fn hand_off(framer: &mut Framer, ctx: &ClientContext) -> ModbusResult<usize> {
    let mut queued = 0;
    while let Some(frame) = framer.frame() {
        let session = Session::from_header(ctx.handle, &frame.header);
        if !ctx.queue.try_enqueue(&session, &frame.pdu) {
            debug!("Transaction queue full, {} tid={} waiting", ctx.handle, session.transaction_id);
            return Ok(queued);
        }

        if ctx.packets.is_enabled() {
            let mut raw = frame.header.encode().to_vec();
            raw.extend_from_slice(&frame.pdu);
            ctx.packets.log(PacketDirection::TcpRequest, &raw);
        }
        BridgeStats::incr(&ctx.stats.frames_queued);
        framer.consume()?;
        queued += 1;
    }
    Ok(queued)
}

/// Modbus TCP server: listeners plus per-client tasks
pub struct ModbusTcpServer {
    config: Arc<ModbusTcpServerConfig>,
    queue: Arc<TransactionQueue>,
    registry: Arc<ClientRegistry>,
    stats: Arc<BridgeStats>,
    packets: PacketLogger,
    shutdown_tx: Option<broadcast::Sender<()>>,
    local_addrs: Vec<SocketAddr>,
    listeners: Vec<JoinHandle<()>>,
}

impl ModbusTcpServer {
    pub fn new(
        config: ModbusTcpServerConfig,
        queue: Arc<TransactionQueue>,
        registry: Arc<ClientRegistry>,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            queue,
            registry,
            stats,
            packets: PacketLogger::disabled(),
            shutdown_tx: None,
            local_addrs: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_packet_logger(mut self, packets: PacketLogger) -> Self {
        self.packets = packets;
        self
    }

    /// Addresses the listeners actually bound (resolves port 0)
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: AcceptContext,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => ctx.admit(stream, peer, &shutdown_tx),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            // accept errors are usually fd exhaustion; back off briefly
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Listener stopping");
                    break;
                }
            }
        }
    }
}

/// Shared state of the accept loops
#[derive(Clone)]
struct AcceptContext {
    config: Arc<ModbusTcpServerConfig>,
    queue: Arc<TransactionQueue>,
    registry: Arc<ClientRegistry>,
    stats: Arc<BridgeStats>,
    packets: PacketLogger,
}

impl AcceptContext {
    fn admit(&self, stream: TcpStream, peer: SocketAddr, shutdown_tx: &broadcast::Sender<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_depth.max(1));
        let handle = match self.registry.register(peer, outbound_tx) {
            Some(handle) => handle,
            None => {
                BridgeStats::incr(&self.stats.connections_rejected);
                warn!(
                    "🚫 Rejecting {}: {} clients connected (max {})",
                    peer,
                    self.registry.count(),
                    self.registry.max_clients()
                );
                drop(stream);
                return;
            }
        };

        BridgeStats::incr(&self.stats.connections_accepted);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", peer, e);
        }
        info!("📡 New client connected: {} as {}", peer, handle);

        let ctx = ClientContext {
            handle,
            peer,
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            packets: self.packets.clone(),
            config: self.config.clone(),
        };
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            handle_client(stream, ctx, outbound_rx, shutdown_rx).await;
        });
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.is_running() {
            return Err(ModbusError::protocol("Server is already running"));
        }

        let mut bound = Vec::new();
        for address in &self.config.bind_addresses {
            match TcpListener::bind(address).await {
                Ok(listener) => bound.push(listener),
                // a dual-stack [::] listener may already cover the IPv4 address
                Err(e) => warn!("Failed to bind to {}: {}", address, e),
            }
        }
        if bound.is_empty() {
            return Err(ModbusError::connection(format!(
                "Failed to bind any of {:?}",
                self.config.bind_addresses
            )));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = AcceptContext {
            config: self.config.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            packets: self.packets.clone(),
        };

        self.local_addrs.clear();
        for listener in bound {
            let address = listener.local_addr()?;
            info!("🚀 Modbus TCP server listening on {}", address);
            self.local_addrs.push(address);
            self.listeners
                .push(tokio::spawn(Self::accept_loop(
                    listener,
                    ctx.clone(),
                    shutdown_tx.clone(),
                    shutdown_tx.subscribe(),
                )));
        }

        info!("📊 Server configuration:");
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Client buffer: {} bytes", self.config.client_buffer_size);
        info!("   - Buffer-full timeout: {:?}", self.config.buffer_full_timeout);
        info!("   - Frame-pending timeout: {:?}", self.config.frame_pending_timeout);
        info!("   - Write timeout: {:?}", self.config.write_timeout);

        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        for listener in self.listeners.drain(..) {
            let _ = listener.await;
        }

        info!("⏹️  Modbus TCP server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
