use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use modbus_rtu_gateway::config::GatewayConfig;
use modbus_rtu_gateway::protocol::orchestrator;

/// Multi-port Modbus-RTU serial gateway.
#[derive(Debug, Parser)]
#[command(name = "modbus-rtu-gatewayd", version, about)]
struct Args {
    /// Path to the gateway's TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Exit 0 if `port` is free, non-zero otherwise. Used by operators to
    /// probe port availability without starting the full gateway.
    #[arg(long, value_name = "PORT")]
    check_port: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    if let Some(port) = args.check_port {
        return check_port(&port);
    }

    match run(&args.config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("startup failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &PathBuf) -> Result<()> {
    let config = GatewayConfig::load(config_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    orchestrator::run(config, shutdown)
}

/// Exit 0 (free) if the device can be opened exclusively, non-zero
/// (occupied or missing) otherwise.
fn check_port(port: &str) -> ExitCode {
    match serialport::new(port, 9600).open() {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
