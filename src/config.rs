//! Gateway configuration. The on-disk format is TOML; the rest of the
//! crate only ever sees this parsed struct.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> i32 {
    16
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_bytes_per_request() -> usize {
    65536
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_bytes_per_request")]
    pub max_bytes_per_request: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfigEntry {
    pub name: String,
    pub description: Option<String>,
    pub baudrate: u32,
    pub timeout: Option<f64>,
}

fn default_send_time() -> f64 {
    0.1
}
fn default_receive_time() -> f64 {
    0.05
}
fn default_error_time() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialTimingsConfig {
    #[serde(default = "default_send_time")]
    pub send_time: f64,
    #[serde(default = "default_receive_time")]
    pub receive_time: f64,
    #[serde(default = "default_error_time")]
    pub send_error_time: f64,
    #[serde(default = "default_error_time")]
    pub receive_error_time: f64,
}

impl Default for SerialTimingsConfig {
    fn default() -> Self {
        Self {
            send_time: default_send_time(),
            receive_time: default_receive_time(),
            send_error_time: default_error_time(),
            receive_error_time: default_error_time(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub tcp_server: TcpServerConfig,
    #[serde(default)]
    pub serial_ports: Vec<PortConfigEntry>,
    #[serde(default)]
    pub serial: SerialTimingsConfig,
    #[serde(default)]
    pub modbus: ModbusConfig,
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing gateway configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [tcp_server]
            port = 5020

            [[serial_ports]]
            name = "P1"
            baudrate = 9600
        "#;
        let cfg = GatewayConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.tcp_server.port, 5020);
        assert_eq!(cfg.tcp_server.host, "0.0.0.0");
        assert_eq!(cfg.serial_ports.len(), 1);
        assert_eq!(cfg.serial_ports[0].name, "P1");
        assert_eq!(cfg.modbus.retries, 3);
    }

    #[test]
    fn rejects_missing_required_port() {
        let raw = r#"
            [tcp_server]
            host = "127.0.0.1"
        "#;
        assert!(GatewayConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn loads_from_a_file_on_disk() {
        let raw = r#"
            [tcp_server]
            host = "127.0.0.1"
            port = 9000

            [[serial_ports]]
            name = "P1"
            description = "FTDI"
            baudrate = 19200
            timeout = 0.5
        "#;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::io::Write::write_all(&mut file, raw.as_bytes()).unwrap();

        let cfg = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(cfg.tcp_server.port, 9000);
        assert_eq!(cfg.serial_ports[0].description.as_deref(), Some("FTDI"));
    }
}
