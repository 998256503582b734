/// Modbus TCP to RTU bridge
///
/// Usage: `modbus_bridge [config.yaml|config.json]`
///
/// Without a config file every default applies: listen on 0.0.0.0:502 and
/// talk to /dev/ttyUSB0 at 115200 baud, no parity. Set `serial.port` to
/// `simulator` to run against the in-memory echo bus.

use anyhow::Context;
use log::{error, info};
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

use modbus_rtu_bridge::logging::init_logger;
use modbus_rtu_bridge::utils::{format, logging::log_stats};
use modbus_rtu_bridge::{BridgeConfig, ModbusBridge};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => BridgeConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => BridgeConfig::default(),
    };
    init_logger(config.logging.level);

    info!("🚀 {}", modbus_rtu_bridge::info());

    let mut bridge = ModbusBridge::new(config).context("invalid configuration")?;
    bridge.start().await.context("starting bridge")?;
    for address in bridge.local_addrs() {
        info!("📍 Listening on {}", address);
    }

    let mut ticker = interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("🛑 Received interrupt signal, stopping bridge..."),
                    Err(err) => error!("❌ Failed to listen for interrupt signal: {}", err),
                }
                break;
            }
            _ = ticker.tick() => log_stats(&bridge.stats()),
        }
    }

    bridge.stop().await.context("stopping bridge")?;
    info!("{}", format::format_stats(&bridge.stats()));
    Ok(())
}
