//! JSON-over-TCP request dispatcher: a listen socket plus one worker
//! thread per accepted connection. Framing is brace-balanced rather than
//! length-prefixed or newline-delimited, so a client can pack several
//! requests into one `send()` or split one across several.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use socket2::{Domain, Socket, Type};

use crate::config::TcpServerConfig;
use crate::protocol::registry::PortRegistry;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind `{host, port}` with `SO_REUSEADDR` and a listen backlog of
/// `max_connections`, mirroring the original's `setsockopt(SO_REUSEADDR, 1)`
/// + `listen(max_connections)` pair.
fn bind_listener(tcp: &TcpServerConfig) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", tcp.host, tcp.port)
        .parse()
        .with_context(|| format!("parsing bind address {}:{}", tcp.host, tcp.port))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .context("creating dispatcher socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding {}:{}", tcp.host, tcp.port))?;
    socket
        .listen(tcp.max_connections)
        .context("starting listen backlog")?;

    Ok(socket.into())
}

pub fn run(registry: Arc<PortRegistry>, tcp: &TcpServerConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let listener = bind_listener(tcp)?;
    listener
        .set_nonblocking(true)
        .context("setting listener non-blocking")?;

    log::info!("dispatcher listening on {}:{}", tcp.host, tcp.port);

    let max_bytes_per_request = tcp.max_bytes_per_request;
    let buffer_size = tcp.buffer_size;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("accepted connection from {addr}");
                let registry = Arc::clone(&registry);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    if let Err(err) =
                        handle_client(stream, registry, shutdown, buffer_size, max_bytes_per_request)
                    {
                        log::warn!("connection from {addr} closed: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                log::error!("accept failed: {err}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    Ok(())
}

fn handle_client(
    mut stream: TcpStream,
    registry: Arc<PortRegistry>,
    shutdown: Arc<AtomicBool>,
    buffer_size: usize,
    max_bytes_per_request: usize,
) -> Result<()> {
    stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
    let mut accumulator: Vec<u8> = Vec::new();
    let mut read_buf = vec![0u8; buffer_size];

    while !shutdown.load(Ordering::SeqCst) {
        match stream.read(&mut read_buf) {
            Ok(0) => break, // peer closed
            Ok(n) => {
                accumulator.extend_from_slice(&read_buf[..n]);
                loop {
                    match next_candidate(&accumulator, max_bytes_per_request) {
                        CandidateResult::None => break,
                        CandidateResult::TooLarge(skip_to) => {
                            let reply = json!({"status": "error", "message": "request exceeds max_bytes_per_request"});
                            write_reply(&mut stream, &reply)?;
                            accumulator.drain(0..skip_to);
                        }
                        CandidateResult::Found { start, end } => {
                            let candidate = accumulator[start..end].to_vec();
                            accumulator.drain(0..end);
                            match std::str::from_utf8(&candidate)
                                .ok()
                                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                            {
                                Some(request) => {
                                    let reply = dispatch(&request, &registry, &shutdown);
                                    write_reply(&mut stream, &reply)?;
                                }
                                None => {
                                    let reply =
                                        json!({"status": "error", "message": "malformed JSON request"});
                                    write_reply(&mut stream, &reply)?;
                                }
                            }
                        }
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

enum CandidateResult {
    None,
    Found { start: usize, end: usize },
    TooLarge(usize),
}

/// Scan `buf` from the first `{`, tracking brace depth, and return the
/// span of the first complete JSON object if one is present.
fn next_candidate(buf: &[u8], max_bytes_per_request: usize) -> CandidateResult {
    let Some(start) = buf.iter().position(|&b| b == b'{') else {
        return CandidateResult::None;
    };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in buf[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return CandidateResult::Found { start, end };
                }
            }
            _ => {}
        }

        if offset + 1 > max_bytes_per_request {
            return CandidateResult::TooLarge(start + offset + 1);
        }
    }

    CandidateResult::None
}

fn write_reply(stream: &mut TcpStream, reply: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(reply)?;
    bytes.push(b'\n');
    stream.write_all(&bytes)?;
    Ok(())
}

fn error(message: impl Into<String>) -> Value {
    json!({"status": "error", "message": message.into()})
}

fn dispatch(request: &Value, registry: &PortRegistry, shutdown: &AtomicBool) -> Value {
    let Some(action) = request.get("action").and_then(Value::as_str) else {
        return error("missing or invalid 'action' field");
    };

    match action {
        "send" => dispatch_send(request, registry),
        "receive" => dispatch_receive(request, registry),
        "queue_size" => dispatch_queue_size(request, registry),
        "clear_queue" => dispatch_clear_queue(request, registry),
        "status" => dispatch_status(registry, shutdown),
        other => error(format!("unknown action '{other}'")),
    }
}

fn port_name(request: &Value) -> Option<&str> {
    request.get("port").and_then(Value::as_str)
}

fn dispatch_send(request: &Value, registry: &PortRegistry) -> Value {
    let Some(name) = port_name(request) else {
        return error("missing 'port' field");
    };
    let Some(data) = request.get("data").and_then(Value::as_array) else {
        return error("missing 'data' field");
    };
    let Some([slave, fc, start, qty]) = data
        .iter()
        .map(|v| v.as_u64())
        .collect::<Option<Vec<_>>>()
        .as_deref()
    else {
        return error("'data' must be [slave, function_code, start, quantity]");
    };

    let (slave, fc, start, qty) = match (
        u8::try_from(*slave),
        u8::try_from(*fc),
        u16::try_from(*start),
        u16::try_from(*qty),
    ) {
        (Ok(slave), Ok(fc), Ok(start), Ok(qty)) => (slave, fc, start, qty),
        _ => {
            return error(
                "'data' out of range: slave and function_code must be 0..=255, start and quantity must be 0..=65535",
            )
        }
    };

    match registry.get(name) {
        Some(handler) => {
            let accepted = handler.enqueue_request(slave, fc, start, qty);
            if accepted {
                json!({"status": "success", "message": format!("queued request for port {name}")})
            } else {
                error(format!("port '{name}' is not connected"))
            }
        }
        None => error(format!("unknown port '{name}'")),
    }
}

fn dispatch_receive(request: &Value, registry: &PortRegistry) -> Value {
    let Some(name) = port_name(request) else {
        return error("missing 'port' field");
    };
    let num = request.get("num").and_then(Value::as_u64).unwrap_or(0);
    if num == 0 {
        return error("'num' must be a positive integer");
    }

    match registry.get(name) {
        Some(handler) => {
            let frames = handler.extract_frames(num as usize);
            json!({"status": "success", "port": name, "frames": frames})
        }
        None => error(format!("unknown port '{name}'")),
    }
}

fn dispatch_queue_size(request: &Value, registry: &PortRegistry) -> Value {
    let Some(name) = port_name(request) else {
        return error("missing 'port' field");
    };
    match registry.get(name) {
        Some(handler) => json!({"status": "success", "port": name, "size": handler.queue_len()}),
        None => error(format!("unknown port '{name}'")),
    }
}

fn dispatch_clear_queue(request: &Value, registry: &PortRegistry) -> Value {
    let Some(name) = port_name(request) else {
        return error("missing 'port' field");
    };
    match registry.get(name) {
        Some(handler) => {
            handler.clear_queue();
            json!({"status": "success", "message": format!("cleared queue for port {name}")})
        }
        None => error(format!("unknown port '{name}'")),
    }
}

fn dispatch_status(registry: &PortRegistry, shutdown: &AtomicBool) -> Value {
    let ports: serde_json::Map<String, Value> = registry
        .status_all()
        .into_iter()
        .map(|(name, status)| {
            (
                name,
                json!({"connected": status.connected, "queue_size": status.queue_size}),
            )
        })
        .collect();
    let server_running = !shutdown.load(Ordering::SeqCst);
    json!({"status": "success", "server_running": server_running, "ports": ports})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_single_candidate() {
        let buf = b"{\"action\":\"status\"}";
        match next_candidate(buf, 1024) {
            CandidateResult::Found { start, end } => {
                assert_eq!(start, 0);
                assert_eq!(end, buf.len());
            }
            _ => panic!("expected a candidate"),
        }
    }

    #[test]
    fn skips_leading_garbage() {
        let buf = b"garbage{\"action\":\"status\"}";
        match next_candidate(buf, 1024) {
            CandidateResult::Found { start, end } => {
                assert_eq!(start, 7);
                assert_eq!(end, buf.len());
            }
            _ => panic!("expected a candidate"),
        }
    }

    #[test]
    fn finds_first_of_two_concatenated_objects() {
        let buf = b"{\"action\":\"status\"}{\"action\":\"queue_size\",\"port\":\"P1\"}";
        match next_candidate(buf, 1024) {
            CandidateResult::Found { start, end } => {
                assert_eq!(&buf[start..end], b"{\"action\":\"status\"}".as_slice());
            }
            _ => panic!("expected a candidate"),
        }
    }

    #[test]
    fn incomplete_object_returns_none() {
        let buf = b"{\"action\":\"status\"";
        assert!(matches!(next_candidate(buf, 1024), CandidateResult::None));
    }

    #[test]
    fn missing_action_is_an_error() {
        let shutdown = AtomicBool::new(false);
        let reply = dispatch(&json!({}), &registry_with_no_ports(), &shutdown);
        assert_eq!(reply["status"], "error");
    }

    #[test]
    fn unknown_port_is_an_error_not_a_crash() {
        let shutdown = AtomicBool::new(false);
        let reply = dispatch(
            &json!({"action": "queue_size", "port": "nope"}),
            &registry_with_no_ports(),
            &shutdown,
        );
        assert_eq!(reply["status"], "error");
    }

    #[test]
    fn status_reports_server_running_from_shutdown_flag() {
        let registry = registry_with_no_ports();

        let running = AtomicBool::new(false);
        let reply = dispatch(&json!({"action": "status"}), &registry, &running);
        assert_eq!(reply["server_running"], true);

        let stopped = AtomicBool::new(true);
        let reply = dispatch(&json!({"action": "status"}), &registry, &stopped);
        assert_eq!(reply["server_running"], false);
    }

    #[test]
    fn send_rejects_out_of_range_fields_instead_of_truncating() {
        let registry = registry_with_no_ports();
        let reply = dispatch_send(
            &json!({"port": "P1", "data": [1, 3, 70000, 4]}),
            &registry,
        );
        assert_eq!(reply["status"], "error");
    }

    fn registry_with_no_ports() -> PortRegistry {
        PortRegistry::bring_up(&[], 4096, &Default::default(), 3)
    }
}
