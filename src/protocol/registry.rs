//! Port registry: resolves configured port identities against the serial
//! devices the OS currently exposes, connects each one, and exposes
//! lookup by logical name for the dispatcher.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{PortConfigEntry, SerialTimingsConfig};
use crate::protocol::port::{PortHandler, PortStatus, SerialTimings};

/// One OS-visible serial device, as reported by the platform's enumeration.
#[derive(Debug, Clone)]
pub struct OsPort {
    pub device_id: String,
    pub description: String,
}

pub fn enumerate_os_ports() -> Vec<OsPort> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let description = match &p.port_type {
                    serialport::SerialPortType::UsbPort { product, .. } => product
                        .clone()
                        .unwrap_or_else(|| p.port_name.clone()),
                    _ => p.port_name.clone(),
                };
                OsPort {
                    device_id: p.port_name,
                    description,
                }
            })
            .collect(),
        Err(err) => {
            log::warn!("failed to enumerate serial ports: {err}");
            Vec::new()
        }
    }
}

/// Resolve a configured port against the OS device list. Matches by
/// description substring first (case-insensitive), falling back to an
/// exact `device_id == name` match. Returns the configured name unchanged
/// if nothing matches.
pub fn resolve_device_path(entry: &PortConfigEntry, os_ports: &[OsPort]) -> String {
    if let Some(description) = &entry.description {
        let needle = description.to_lowercase();
        if let Some(found) = os_ports
            .iter()
            .find(|p| p.description.to_lowercase().contains(&needle))
        {
            return found.device_id.clone();
        }
    }

    if let Some(found) = os_ports.iter().find(|p| p.device_id == entry.name) {
        return found.device_id.clone();
    }

    log::warn!(
        "port {}: no OS device matched description/name, using configured name as-is",
        entry.name
    );
    entry.name.clone()
}

pub struct PortRegistry {
    handlers: HashMap<String, PortHandler>,
}

impl PortRegistry {
    /// Enumerate OS devices, resolve and connect every configured port.
    /// Tolerates partial failure: ports that fail to open are logged and
    /// skipped. Returns an empty registry if every port failed.
    pub fn bring_up(
        ports: &[PortConfigEntry],
        buffer_size: usize,
        timings: &SerialTimingsConfig,
        modbus_retries: u32,
    ) -> Self {
        let os_ports = enumerate_os_ports();
        log::info!("discovered {} OS serial device(s)", os_ports.len());
        for p in &os_ports {
            log::info!("  - {} ({})", p.device_id, p.description);
        }

        let serial_timings = SerialTimings {
            send_time: Duration::from_secs_f64(timings.send_time),
            receive_time: Duration::from_secs_f64(timings.receive_time),
            send_error_time: Duration::from_secs_f64(timings.send_error_time),
            receive_error_time: Duration::from_secs_f64(timings.receive_error_time),
        };

        let mut handlers = HashMap::new();
        for entry in ports {
            let device_path = resolve_device_path(entry, &os_ports);
            let effective_name = device_path.clone();
            let timeout = Duration::from_secs_f64(entry.timeout.unwrap_or(1.0));

            match PortHandler::connect(
                effective_name.clone(),
                &device_path,
                entry.baudrate,
                timeout,
                buffer_size,
                serial_timings,
                modbus_retries,
            ) {
                Ok(handler) => {
                    log::info!("port {effective_name}: connected");
                    handlers.insert(effective_name, handler);
                }
                Err(err) => {
                    log::error!("port {}: failed to connect: {err:#}", entry.name);
                }
            }
        }

        Self { handlers }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn get(&self, name: &str) -> Option<&PortHandler> {
        self.handlers.get(name)
    }

    pub fn status_all(&self) -> HashMap<String, PortStatus> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.clone(), handler.status()))
            .collect()
    }

    pub fn shutdown_all(&mut self) {
        for (_, handler) in self.handlers.iter_mut() {
            handler.shutdown();
        }
    }
}
