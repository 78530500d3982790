//! Serial transmission to an Enttec DMX USB Pro adapter.
//!
//! The serial port is blocking I/O and is owned exclusively by a
//! dedicated worker thread, which multiplexes a 25 ms frame ticker, the
//! control channel, and reconnect timers with `crossbeam_channel::select!`.
//! The engine publishes the latest effective snapshot into a shared cell;
//! every tick the worker samples it and writes one framed packet.
//!
//! Connection handling is a small state machine: scan for a device, open
//! it, stay connected until the per-tick health probe fails, then retry
//! with exponential backoff (1 s doubling to a 30 s cap, reset on a
//! successful open).

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, tick, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::universe::{Snapshot, DMX_CHANNELS};

/// Enttec "Send DMX" label.
const LABEL_SEND_DMX: u8 = 0x06;
const FRAME_START: u8 = 0x7E;
const FRAME_END: u8 = 0xE7;
/// Payload length: start code byte + 512 channel bytes.
const PAYLOAD_LEN: usize = DMX_CHANNELS + 1;
/// Full frame: start, label, two length bytes, payload, end.
pub const FRAME_LEN: usize = PAYLOAD_LEN + 5;

const ENTTEC_VID: u16 = 0x0403;
const ENTTEC_PID: u16 = 0x6001;

const TICK_PERIOD: Duration = Duration::from_millis(25);
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Encode one universe snapshot as an Enttec "Send DMX" packet.
pub fn encode_frame(channels: &Snapshot) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = FRAME_START;
    frame[1] = LABEL_SEND_DMX;
    frame[2] = (PAYLOAD_LEN & 0xFF) as u8;
    frame[3] = (PAYLOAD_LEN >> 8) as u8;
    frame[4] = 0x00; // DMX start code
    frame[5..5 + DMX_CHANNELS].copy_from_slice(channels);
    frame[FRAME_LEN - 1] = FRAME_END;
    frame
}

/// Published on every transition into or out of the connected state.
#[derive(Clone, Debug, PartialEq)]
pub struct TxStatus {
    pub connected: bool,
    pub port: Option<String>,
}

#[derive(Debug)]
pub enum TxControl {
    Restart,
    Shutdown,
}

/// An open DMX output port. Production wraps `serialport`; tests script it.
pub trait DmxPort: Send {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Health probe run once per tick; an error drives the state machine
    /// to Disconnected (write errors alone do not).
    fn check(&mut self) -> io::Result<()>;
    fn path(&self) -> &str;
}

/// Discovers and opens DMX ports.
pub trait PortProvider: Send {
    fn discover(&mut self) -> Option<String>;
    fn open(&mut self, path: &str) -> io::Result<Box<dyn DmxPort>>;
}

/// Real provider backed by the `serialport` crate.
pub struct SerialProvider {
    /// Explicit device path from configuration, bypassing discovery.
    pub override_path: Option<String>,
}

impl PortProvider for SerialProvider {
    fn discover(&mut self) -> Option<String> {
        if let Some(path) = &self.override_path {
            return Some(path.clone());
        }
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                log::warn!("serial enumeration failed: {e}");
                return None;
            }
        };

        let matches: Vec<&serialport::SerialPortInfo> = ports
            .iter()
            .filter(|p| match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    usb.vid == ENTTEC_VID && usb.pid == ENTTEC_PID
                }
                _ => false,
            })
            .collect();

        if matches.len() > 1 {
            log::warn!(
                "{} DMX adapters found, using {}",
                matches.len(),
                matches[0].port_name
            );
        }
        if let Some(found) = matches.first() {
            return Some(found.port_name.clone());
        }

        ports
            .iter()
            .find(|p| p.port_name.to_lowercase().contains("usbserial"))
            .map(|p| p.port_name.clone())
    }

    fn open(&mut self, path: &str) -> io::Result<Box<dyn DmxPort>> {
        let port = serialport::new(path, 250_000)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::Two)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SerialDmxPort {
            port,
            path: path.to_string(),
        }))
    }
}

struct SerialDmxPort {
    port: Box<dyn serialport::SerialPort>,
    path: String,
}

impl DmxPort for SerialDmxPort {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn check(&mut self) -> io::Result<()> {
        // An unplugged adapter disappears from enumeration before writes
        // start failing reliably.
        let still_present = serialport::available_ports()
            .map(|ports| ports.iter().any(|p| p.port_name == self.path))
            .unwrap_or(false);
        if still_present {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "device removed"))
        }
    }

    fn path(&self) -> &str {
        &self.path
    }
}

struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_BACKOFF,
        }
    }

    /// Delay to wait before the next attempt; doubles for the one after.
    fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
        current
    }

    fn reset(&mut self) {
        self.delay = INITIAL_BACKOFF;
    }
}

/// Connection state machine, separated from the worker thread so tests
/// can drive it with scripted providers and no real clock.
struct TxCore {
    provider: Box<dyn PortProvider>,
    port: Option<Box<dyn DmxPort>>,
    backoff: Backoff,
    status_tx: UnboundedSender<TxStatus>,
}

impl TxCore {
    fn new(provider: Box<dyn PortProvider>, status_tx: UnboundedSender<TxStatus>) -> Self {
        Self {
            provider,
            port: None,
            backoff: Backoff::new(),
            status_tx,
        }
    }

    fn connected(&self) -> bool {
        self.port.is_some()
    }

    fn publish(&self, connected: bool, port: Option<String>) {
        let _ = self.status_tx.send(TxStatus { connected, port });
    }

    /// Scan and open. Returns the reconnect delay on failure, `None` when
    /// connected.
    fn connect_attempt(&mut self) -> Option<Duration> {
        let Some(path) = self.provider.discover() else {
            log::debug!("no DMX adapter found");
            return Some(self.backoff.next());
        };
        match self.provider.open(&path) {
            Ok(port) => {
                log::info!("DMX adapter connected on {path}");
                self.backoff.reset();
                self.publish(true, Some(port.path().to_string()));
                self.port = Some(port);
                None
            }
            Err(e) => {
                log::warn!("failed to open {path}: {e}");
                Some(self.backoff.next())
            }
        }
    }

    /// One 25 ms tick: write the frame if connected, then probe health.
    /// Returns a reconnect delay when the connection was lost.
    fn on_tick(&mut self, channels: &Snapshot) -> Option<Duration> {
        let port = self.port.as_mut()?;
        let frame = encode_frame(channels);
        if let Err(e) = port.write_frame(&frame) {
            log::warn!("DMX frame write failed: {e}");
        }
        if let Err(e) = port.check() {
            let path = port.path().to_string();
            log::warn!("DMX adapter on {path} lost: {e}");
            self.port = None;
            self.publish(false, None);
            return Some(self.backoff.next());
        }
        None
    }

    /// Drop the port (restart, shutdown). Publishes only when a port was
    /// actually open.
    fn force_disconnect(&mut self) {
        if self.port.take().is_some() {
            self.publish(false, None);
        }
    }
}

/// Handle to the transmitter worker thread.
pub struct Transmitter {
    control: Sender<TxControl>,
    handle: Option<JoinHandle<()>>,
}

impl Transmitter {
    /// Spawn the worker and begin scanning immediately. `frame` is the
    /// cell the engine keeps filled with the latest effective snapshot.
    pub fn spawn(
        provider: Box<dyn PortProvider>,
        frame: Arc<Mutex<Snapshot>>,
        status_tx: UnboundedSender<TxStatus>,
    ) -> Self {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let core = TxCore::new(provider, status_tx);
        let handle = std::thread::Builder::new()
            .name("dmx-tx".into())
            .spawn(move || run_worker(core, frame, control_rx))
            .expect("spawn dmx worker thread");
        Self {
            control: control_tx,
            handle: Some(handle),
        }
    }

    /// Force-close the port and rescan with a fresh backoff.
    pub fn restart(&self) {
        let _ = self.control.send(TxControl::Restart);
    }

    pub fn shutdown(&mut self) {
        let _ = self.control.send(TxControl::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        let _ = self.control.send(TxControl::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(mut core: TxCore, frame: Arc<Mutex<Snapshot>>, control: Receiver<TxControl>) {
    let ticker = tick(TICK_PERIOD);
    let none = never::<Instant>();
    // Scan right away on startup.
    let mut reconnect: Option<Receiver<Instant>> = Some(after(Duration::ZERO));

    loop {
        let reconnect_rx = reconnect.clone().unwrap_or_else(|| none.clone());
        crossbeam_channel::select! {
            recv(control) -> msg => match msg {
                Ok(TxControl::Restart) => {
                    core.force_disconnect();
                    core.backoff.reset();
                    reconnect = Some(after(Duration::ZERO));
                }
                Ok(TxControl::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if core.connected() {
                    let snapshot = *frame.lock();
                    if let Some(delay) = core.on_tick(&snapshot) {
                        reconnect = Some(after(delay));
                    }
                }
            },
            recv(reconnect_rx) -> _ => {
                reconnect = match core.connect_attempt() {
                    Some(delay) => Some(after(delay)),
                    None => None,
                };
            },
        }
    }
    core.force_disconnect();
    log::info!("DMX transmitter stopped");
}
