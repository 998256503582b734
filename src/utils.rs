//! Utility functions and helpers for the bridge
//!
//! This module contains the bridge-wide statistics counters, formatting
//! helpers and test logging setup.

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by the listeners, client handlers and the RTU task
///
/// Every counter is a relaxed atomic: they are read for reporting only and
/// never used to synchronise anything.
#[derive(Debug)]
pub struct BridgeStats {
    started_at: DateTime<Utc>,
    started: Instant,
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub connections_evicted: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub frames_queued: AtomicU64,
    pub transactions: AtomicU64,
    pub responses_delivered: AtomicU64,
    pub broadcasts: AtomicU64,
    pub rtu_timeouts: AtomicU64,
    pub crc_mismatches: AtomicU64,
    pub unit_mismatches: AtomicU64,
    pub overflows: AtomicU64,
    pub line_errors: AtomicU64,
    pub exceptions_sent: AtomicU64,
    pub bytes_from_clients: AtomicU64,
    pub bytes_to_clients: AtomicU64,
    pub bytes_to_bus: AtomicU64,
    pub bytes_from_bus: AtomicU64,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_evicted: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            frames_queued: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            rtu_timeouts: AtomicU64::new(0),
            crc_mismatches: AtomicU64::new(0),
            unit_mismatches: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            line_errors: AtomicU64::new(0),
            exceptions_sent: AtomicU64::new(0),
            bytes_from_clients: AtomicU64::new(0),
            bytes_to_clients: AtomicU64::new(0),
            bytes_to_bus: AtomicU64::new(0),
            bytes_from_bus: AtomicU64::new(0),
        }
    }

    /// Add `n` to a counter
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Bump a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            started_at: self.started_at,
            uptime_seconds: self.started.elapsed().as_secs(),
            connections_accepted: load(&self.connections_accepted),
            connections_rejected: load(&self.connections_rejected),
            connections_evicted: load(&self.connections_evicted),
            malformed_frames: load(&self.malformed_frames),
            frames_queued: load(&self.frames_queued),
            transactions: load(&self.transactions),
            responses_delivered: load(&self.responses_delivered),
            broadcasts: load(&self.broadcasts),
            rtu_timeouts: load(&self.rtu_timeouts),
            crc_mismatches: load(&self.crc_mismatches),
            unit_mismatches: load(&self.unit_mismatches),
            overflows: load(&self.overflows),
            line_errors: load(&self.line_errors),
            exceptions_sent: load(&self.exceptions_sent),
            bytes_from_clients: load(&self.bytes_from_clients),
            bytes_to_clients: load(&self.bytes_to_clients),
            bytes_to_bus: load(&self.bytes_to_bus),
            bytes_from_bus: load(&self.bytes_from_bus),
        }
    }
}

/// Point-in-time copy of [`BridgeStats`], serialisable for the status API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_evicted: u64,
    pub malformed_frames: u64,
    pub frames_queued: u64,
    pub transactions: u64,
    pub responses_delivered: u64,
    pub broadcasts: u64,
    pub rtu_timeouts: u64,
    pub crc_mismatches: u64,
    pub unit_mismatches: u64,
    pub overflows: u64,
    pub line_errors: u64,
    pub exceptions_sent: u64,
    pub bytes_from_clients: u64,
    pub bytes_to_clients: u64,
    pub bytes_to_bus: u64,
    pub bytes_from_bus: u64,
}

impl StatsSnapshot {
    /// Share of answered unicast transactions, as a percentage
    pub fn success_rate(&self) -> f64 {
        let unicast = self.transactions.saturating_sub(self.broadcasts);
        if unicast == 0 {
            return 0.0;
        }
        (self.responses_delivered.saturating_sub(self.exceptions_sent) as f64 / unicast as f64) * 100.0
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let micros = duration.as_micros();
        if micros < 1000 {
            format!("{}µs", micros)
        } else if micros < 1_000_000 {
            format!("{:.2}ms", duration.as_secs_f64() * 1000.0)
        } else if micros < 60_000_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let millis = duration.as_millis();
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format statistics as a table
    pub fn format_stats(stats: &StatsSnapshot) -> String {
        format!(
            "Bridge Statistics (up {} since {}):\n\
             ├─ Connections: {} accepted, {} rejected, {} evicted\n\
             ├─ Frames queued: {} ({} malformed)\n\
             ├─ Transactions: {} ({} broadcast)\n\
             ├─ Responses delivered: {} ({:.1}%)\n\
             ├─ Failures: {} timeouts, {} CRC, {} unit, {} overflow\n\
             ├─ Line errors: {}\n\
             └─ Bytes: tcp in {} / out {}, bus out {} / in {}",
            format_duration(Duration::from_secs(stats.uptime_seconds)),
            stats.started_at.format("%Y-%m-%d %H:%M:%S"),
            stats.connections_accepted,
            stats.connections_rejected,
            stats.connections_evicted,
            stats.frames_queued,
            stats.malformed_frames,
            stats.transactions,
            stats.broadcasts,
            stats.responses_delivered,
            stats.success_rate(),
            stats.rtu_timeouts,
            stats.crc_mismatches,
            stats.unit_mismatches,
            stats.overflows,
            stats.line_errors,
            stats.bytes_from_clients,
            stats.bytes_to_clients,
            stats.bytes_to_bus,
            stats.bytes_from_bus,
        )
    }
}

/// Logging utilities
pub mod logging {
    use super::*;

    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    /// Log a one-line summary of the statistics
    pub fn log_stats(stats: &StatsSnapshot) {
        info!(
            "📊 {} transactions, {} delivered, {} timeouts, {} CRC errors, {} clients accepted",
            stats.transactions,
            stats.responses_delivered,
            stats.rtu_timeouts,
            stats.crc_mismatches,
            stats.connections_accepted
        );
    }
}
