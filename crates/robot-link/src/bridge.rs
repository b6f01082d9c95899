//! Robot-side bridge: relay WebSocket in, serial line out.
//!
//! Inbound text is validated before it reaches the hardware; valid commands
//! are written unchanged plus the line terminator. Losing the relay never ends
//! the bridge: it stops the base and keeps reconnecting on a fixed delay.

use std::{
    io::{Read, Write},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use intercept::VelocityCommand;
use serialport::SerialPort;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::{
    error::LinkError,
    protocol::{self, LINE_TERMINATOR, ProtocolError},
    ws::{self, WsStream},
};

/// Byte sink for command lines, normally a serial port.
pub trait HardwareLink: Send {
    /// Write `line` followed by the protocol terminator.
    fn write_line(&mut self, line: &str) -> Result<(), LinkError>;

    /// Complete acknowledgment lines received since the last call.
    fn drain_acks(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub struct SerialLink {
    path: String,
    baud_rate: u32,
    settle: Duration,
    port: Option<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialLink {
    /// The port is opened lazily on the first write.
    pub fn new(path: impl Into<String>, baud_rate: u32, settle: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            settle,
            port: None,
            pending: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn open(&mut self) -> Result<(), LinkError> {
        if self.port.is_some() {
            return Ok(());
        }

        match serialport::available_ports() {
            Ok(ports) if !ports.iter().any(|p| p.port_name == self.path) => {
                warn!("serial port {} not listed; available ports:", self.path);
                for port in &ports {
                    warn!("  - {}", port.port_name);
                }
            }
            Ok(_) => {}
            Err(err) => debug!("could not enumerate serial ports: {err}"),
        }

        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|source| LinkError::Serial {
                path: self.path.clone(),
                source,
            })?;

        // Opening the port resets most boards; give the firmware time to boot.
        thread::sleep(self.settle);
        info!("serial connected: {} @ {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        self.pending.clear();
        Ok(())
    }

    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("serial port {} closed", self.path);
        }
    }
}

impl HardwareLink for SerialLink {
    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.open()?;
        let Some(port) = self.port.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(LINE_TERMINATOR as u8);

        if let Err(err) = port.write_all(&bytes).and_then(|()| port.flush()) {
            self.port = None;
            return Err(err.into());
        }
        Ok(())
    }

    fn drain_acks(&mut self) -> Vec<String> {
        let Some(port) = self.port.as_mut() else {
            return Vec::new();
        };
        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(err) => {
                debug!("serial bytes_to_read failed: {err}");
                0
            }
        };
        if available > 0 {
            let mut buf = vec![0u8; available];
            match port.read(&mut buf) {
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(err) => debug!("serial ack read failed: {err}"),
            }
        }
        split_lines(&mut self.pending)
    }
}

/// Remove and return every complete line from the front of `pending`.
fn split_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = pending.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = pending.drain(..=last_newline).collect();
    String::from_utf8_lossy(&complete)
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub relay_url: String,
    pub reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
    /// How long a socket read waits before the shutdown flag is checked again.
    pub poll_interval: Duration,
    pub stop_on_disconnect: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8000/ws/robot".into(),
            reconnect_delay: Duration::from_secs(5),
            max_attempts: None,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            stop_on_disconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    Forwarded,
    Rejected(ProtocolError),
    HardwareError,
}

pub struct SerialBridge<H: HardwareLink> {
    hardware: H,
    options: BridgeOptions,
}

impl<H: HardwareLink> SerialBridge<H> {
    pub fn new(hardware: H, options: BridgeOptions) -> Self {
        Self { hardware, options }
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn handle_message(&mut self, message: &str) -> BridgeOutcome {
        let command = protocol::strip_terminator(message);
        if let Err(err) = protocol::validate(command) {
            warn!("invalid command ignored ({err}): {command:?}");
            metrics::counter!("bridge_commands_rejected_total").increment(1);
            return BridgeOutcome::Rejected(err);
        }

        match self.hardware.write_line(command) {
            Ok(()) => {
                metrics::counter!("bridge_commands_forwarded_total").increment(1);
                debug!("sent to hardware: {command}");
                for ack in self.hardware.drain_acks() {
                    debug!("hardware ack: {ack}");
                }
                BridgeOutcome::Forwarded
            }
            Err(err) => {
                metrics::counter!("bridge_serial_errors_total").increment(1);
                error!("failed to write command to hardware: {err}");
                BridgeOutcome::HardwareError
            }
        }
    }

    /// Command the base to halt.
    pub fn stop_hardware(&mut self) {
        let stop = protocol::encode(&VelocityCommand::STOP);
        match self.hardware.write_line(&stop) {
            Ok(()) => info!("stop command sent to hardware"),
            Err(err) => {
                metrics::counter!("bridge_serial_errors_total").increment(1);
                warn!("could not send stop command to hardware: {err}");
            }
        }
    }

    /// Connect to the relay and forward commands until `shutdown` is set.
    ///
    /// Returns [`LinkError::RetriesExhausted`] only when `max_attempts` is set
    /// and that many consecutive connection attempts fail.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), LinkError> {
        let url = self.options.relay_url.clone();
        let mut failures: u32 = 0;

        while !shutdown.load(Ordering::SeqCst) {
            info!("connecting to relay {url}");
            match ws::connect(&url, self.options.connect_timeout) {
                Ok(mut socket) => {
                    failures = 0;
                    info!("relay connected; waiting for commands");
                    if let Err(err) = socket.get_ref().set_read_timeout(Some(self.options.poll_interval)) {
                        warn!("could not set relay read timeout: {err}");
                    }
                    self.pump(&mut socket, shutdown);
                    ws::close(&mut socket);
                    if self.options.stop_on_disconnect {
                        self.stop_hardware();
                    }
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(
                        "relay connection lost; reconnecting in {:?}",
                        self.options.reconnect_delay
                    );
                }
                Err(err) => {
                    failures += 1;
                    warn!("relay connection attempt {failures} failed: {err}");
                    if self.options.max_attempts.is_some_and(|max| failures >= max) {
                        error!("giving up on relay {url} after {failures} attempts");
                        return Err(LinkError::RetriesExhausted(failures));
                    }
                }
            }
            sleep_unless(shutdown, self.options.reconnect_delay);
        }

        info!("bridge shutting down");
        Ok(())
    }

    fn pump(&mut self, socket: &mut WsStream, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    self.handle_message(&text);
                }
                Ok(Message::Close(_)) => {
                    info!("relay closed the connection");
                    return;
                }
                Ok(_) => {}
                Err(err) if ws::is_idle(&err) => {}
                Err(err) => {
                    if !ws::is_closed(&err) {
                        warn!("relay read failed: {err}");
                    }
                    return;
                }
            }
        }
    }
}

fn sleep_unless(flag: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !flag.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
