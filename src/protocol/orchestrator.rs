//! Startup orchestration: bring up every configured port, tolerate
//! partial failure, then hand control to the dispatcher.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::GatewayConfig;
use crate::protocol::dispatcher;
use crate::protocol::registry::PortRegistry;

/// Bring up all configured ports and run the dispatcher until `shutdown`
/// is observed. Fails only if zero ports could be opened.
pub fn run(config: GatewayConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let registry = PortRegistry::bring_up(
        &config.serial_ports,
        config.tcp_server.buffer_size,
        &config.serial,
        config.modbus.retries,
    );

    if registry.is_empty() {
        bail!("no serial port could be opened, refusing to start");
    }

    log::info!("{} of {} configured port(s) connected", registry.len(), config.serial_ports.len());

    dispatcher::run(Arc::new(registry), &config.tcp_server, shutdown)
}
