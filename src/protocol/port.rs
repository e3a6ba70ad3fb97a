//! Per-port handler: one serial device, a receiver thread, a sender
//! thread, an outbound request queue and a receive ring.
//!
//! Modeled on a dedicated-OS-thread design rather than an async loop: each
//! port gets exactly one receiver and one sender thread, both polling a
//! shared shutdown flag between blocking operations so they always have a
//! finite timeout to unblock on.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serialport::SerialPort;

use crate::protocol::crc::crc16;
use crate::protocol::frame::{extract, to_hex_strings};
use crate::protocol::ring::ByteRing;

const DRAIN_RECOVERY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct RequestRecord {
    pub slave: u8,
    pub function_code: u8,
    pub start: u16,
    pub quantity: u16,
}

impl RequestRecord {
    /// Serialize as `slave | fc | start_hi | start_lo | qty_hi | qty_lo | crc_lo | crc_hi`.
    pub fn to_wire(self) -> Vec<u8> {
        let mut header = vec![self.slave, self.function_code];
        header.extend_from_slice(&self.start.to_be_bytes());
        header.extend_from_slice(&self.quantity.to_be_bytes());
        let crc = crc16(&header);
        header.extend_from_slice(&crc);
        header
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SerialTimings {
    pub send_time: Duration,
    pub receive_time: Duration,
    pub send_error_time: Duration,
    pub receive_error_time: Duration,
}

impl Default for SerialTimings {
    fn default() -> Self {
        Self {
            send_time: Duration::from_millis(100),
            receive_time: Duration::from_millis(50),
            send_error_time: Duration::from_secs(1),
            receive_error_time: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    pub name: String,
    pub description: Option<String>,
    pub baudrate: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub connected: bool,
    pub queue_size: usize,
}

pub struct PortHandler {
    name: String,
    ring: Arc<ByteRing>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    outbound_tx: flume::Sender<RequestRecord>,
    modbus_retries: u32,
    receiver_handle: Option<JoinHandle<()>>,
    sender_handle: Option<JoinHandle<()>>,
}

impl PortHandler {
    /// Open `device_path` and spawn the receiver/sender threads. Returns
    /// `Err` (logged by the caller) if the device could not be opened.
    pub fn connect(
        name: String,
        device_path: &str,
        baudrate: u32,
        timeout: Duration,
        buffer_size: usize,
        timings: SerialTimings,
        modbus_retries: u32,
    ) -> Result<Self> {
        let port = serialport::new(device_path, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(timeout)
            .open()
            .with_context(|| format!("opening serial device {device_path}"))?;

        let serial = Arc::new(Mutex::new(port));
        let ring = Arc::new(ByteRing::new(buffer_size));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = flume::unbounded();

        let receiver_handle = {
            let serial = Arc::clone(&serial);
            let ring = Arc::clone(&ring);
            let shutdown = Arc::clone(&shutdown);
            let name = name.clone();
            thread::spawn(move || receiver_loop(name, serial, ring, shutdown, timings))
        };

        let sender_handle = {
            let serial = Arc::clone(&serial);
            let shutdown = Arc::clone(&shutdown);
            let name = name.clone();
            thread::spawn(move || sender_loop(name, serial, outbound_rx, shutdown, timings))
        };

        Ok(Self {
            name,
            ring,
            connected,
            shutdown,
            outbound_tx,
            modbus_retries,
            receiver_handle: Some(receiver_handle),
            sender_handle: Some(sender_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue_request(&self, slave: u8, fc: u8, start: u16, qty: u16) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        self.outbound_tx
            .send(RequestRecord {
                slave,
                function_code: fc,
                start,
                quantity: qty,
            })
            .is_ok()
    }

    pub fn extract_frames(&self, n: usize) -> Vec<String> {
        to_hex_strings(extract(&self.ring, n, self.modbus_retries))
    }

    pub fn queue_len(&self) -> usize {
        self.ring.length()
    }

    pub fn clear_queue(&self) {
        self.ring.clear();
    }

    pub fn status(&self) -> PortStatus {
        PortStatus {
            connected: self.connected.load(Ordering::SeqCst),
            queue_size: self.queue_len(),
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receiver_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sender_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PortHandler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn receiver_loop(
    name: String,
    serial: Arc<Mutex<Box<dyn SerialPort + Send>>>,
    ring: Arc<ByteRing>,
    shutdown: Arc<AtomicBool>,
    timings: SerialTimings,
) {
    let mut pending: Vec<u8> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        if ring.is_paused() {
            let mut drained = 0;
            loop {
                let frames = extract(&ring, 1, 3);
                if frames.is_empty() || drained >= DRAIN_RECOVERY_LIMIT {
                    break;
                }
                log::warn!(
                    "port {name}: drain recovery discarded frame {:02x?}",
                    frames[0]
                );
                drained += 1;
            }
            ring.resume();
        }

        if !pending.is_empty() && !ring.is_paused() {
            flush_pending(&ring, &mut pending);
        }

        let in_waiting = {
            let mut guard = match serial.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            guard.bytes_to_read().unwrap_or(0)
        };

        if in_waiting > 0 {
            let mut buf = vec![0u8; in_waiting as usize];
            let read_result = {
                let mut guard = match serial.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                guard.read(&mut buf)
            };
            match read_result {
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    flush_pending(&ring, &mut pending);
                }
                Err(err) => {
                    log::error!("port {name}: serial read failed: {err}");
                    thread::sleep(timings.receive_error_time);
                }
            }
        } else {
            thread::sleep(timings.receive_time);
        }
    }
}

fn flush_pending(ring: &ByteRing, pending: &mut Vec<u8>) {
    let mut consumed = 0;
    for &byte in pending.iter() {
        if ring.enqueue(byte) {
            consumed += 1;
        } else {
            break;
        }
    }
    pending.drain(0..consumed);
}

fn sender_loop(
    name: String,
    serial: Arc<Mutex<Box<dyn SerialPort + Send>>>,
    outbound_rx: flume::Receiver<RequestRecord>,
    shutdown: Arc<AtomicBool>,
    timings: SerialTimings,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match outbound_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(request) => {
                let wire = request.to_wire();
                let write_result = {
                    let mut guard = match serial.lock() {
                        Ok(g) => g,
                        Err(_) => break,
                    };
                    guard.write_all(&wire).and_then(|_| guard.flush())
                };
                match write_result {
                    Ok(()) => thread::sleep(timings.send_time),
                    Err(err) => {
                        log::error!("port {name}: serial write failed: {err}");
                        thread::sleep(timings.send_error_time);
                    }
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_record_serializes_header_and_crc() {
        let req = RequestRecord {
            slave: 0x01,
            function_code: 0x03,
            start: 0x0002,
            quantity: 0x0004,
        };
        assert_eq!(
            req.to_wire(),
            vec![0x01, 0x03, 0x00, 0x02, 0x00, 0x04, 0xe5, 0xc9]
        );
    }
}
