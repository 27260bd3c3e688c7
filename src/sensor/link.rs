/// Serial link lifecycle management and the continuous read loop
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_serial::{
    ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, SerialStream, StopBits,
};

use crate::models::{LinkState, LinkStatus, Reading};
use crate::parser::parse_line;

/// Default device path when discovery finds nothing (Linux/Raspberry Pi).
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Boot-banner settle time after opening the port.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Upper bound on one idle wait in the read loop.
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Pause after a mid-loop I/O failure before the loop exits.
const READ_ERROR_PAUSE: Duration = Duration::from_secs(5);
/// Bounded wait for the read loop to exit on disconnect.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// A device stuck without newlines must not grow the frame buffer forever.
const MAX_PENDING_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sensor link is not connected")]
    NotConnected,
}

/// Pick a serial port that looks like the sensor board.
///
/// Prefers USB devices whose product string matches the known firmware
/// vendors, then the usual Linux USB-serial device paths. This is a
/// best-effort heuristic; the fallback path may well not exist.
pub fn discover_port() -> String {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    };

    for info in &ports {
        if matches_known_device(&info.port_name, &info.port_type) {
            info!("Discovered sensor device on {}", info.port_name);
            return info.port_name.clone();
        }
    }

    warn!(
        "No known sensor device found, falling back to {}",
        DEFAULT_PORT
    );
    DEFAULT_PORT.to_string()
}

fn matches_known_device(name: &str, port_type: &SerialPortType) -> bool {
    if let SerialPortType::UsbPort(usb) = port_type {
        if let Some(product) = &usb.product {
            if product.contains("Arduino") || product.contains("USB Serial") {
                return true;
            }
        }
    }

    name.contains("ttyUSB") || name.contains("ttyACM")
}

/// Owns the physical connection to the sensor board.
///
/// Lifecycle: Disconnected -> Connecting -> Connected -> Reading, back to
/// Disconnected on any error. The read loop runs as a spawned task and ships
/// decoded readings into a bounded channel; a full channel applies
/// backpressure to the serial reader instead of dropping samples.
pub struct DeviceLink {
    port: String,
    baud_rate: u32,
    state: Arc<Mutex<LinkState>>,
    reader: Option<ReadHalf<SerialStream>>,
    writer: Option<WriteHalf<SerialStream>>,
    shutdown: Option<watch::Sender<bool>>,
    read_task: Option<JoinHandle<()>>,
}

impl DeviceLink {
    pub fn new(port: String, baud_rate: u32) -> Self {
        DeviceLink {
            port,
            baud_rate,
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            reader: None,
            writer: None,
            shutdown: None,
            read_task: None,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn set_port(&mut self, port: String) {
        self.port = port;
    }

    pub fn status(&self) -> LinkStatus {
        let state = self.state();
        LinkStatus {
            connected: matches!(state, LinkState::Connected | LinkState::Reading),
            state,
            port: self.port.clone(),
            baud_rate: self.baud_rate,
        }
    }

    /// Open the serial port with the sensor's fixed 8N1 framing.
    ///
    /// Waits out the device's boot sequence, then drops whatever bytes the
    /// boot banner left in the input buffer so the read loop starts on a
    /// clean frame boundary.
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        self.set_state(LinkState::Connecting);

        let builder = tokio_serial::new(self.port.clone(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One);

        let stream = match SerialStream::open(&builder) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to connect to sensor on {}: {}", self.port, e);
                self.set_state(LinkState::Disconnected);
                return Err(e.into());
            }
        };

        sleep(SETTLE_DELAY).await;
        if let Err(e) = stream.clear(ClearBuffer::Input) {
            warn!("Could not clear stale input buffer: {}", e);
        }

        let (reader, writer) = tokio::io::split(stream);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.set_state(LinkState::Connected);
        info!("Connected to sensor on {}", self.port);
        Ok(())
    }

    /// Spawn the continuous read loop, delivering readings into `tx`.
    pub fn start_reading(&mut self, tx: mpsc::Sender<Reading>) -> Result<(), LinkError> {
        let reader = self.reader.take().ok_or(LinkError::NotConnected)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.set_state(LinkState::Reading);
        self.read_task = Some(tokio::spawn(read_loop(
            reader,
            tx,
            Arc::clone(&self.state),
            shutdown_rx,
        )));
        Ok(())
    }

    /// Best-effort write of a newline-terminated command to the device.
    pub async fn send_command(&mut self, command: &str) -> Result<(), LinkError> {
        let writer = self.writer.as_mut().ok_or(LinkError::NotConnected)?;
        writer.write_all(format!("{}\n", command).as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Tear the link down from any state.
    ///
    /// Signals the read loop, waits a bounded time for it to exit (aborting
    /// it if it does not), closes the port and leaves the state Disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        if let Some(mut task) = self.read_task.take() {
            if timeout(JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Read loop did not stop within {:?}, aborting it", JOIN_TIMEOUT);
                task.abort();
            }
        }

        self.reader = None;
        self.writer = None;
        self.set_state(LinkState::Disconnected);
        info!("Disconnected from sensor");
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap() = state;
    }
}

/// The continuous read loop.
///
/// Polls the port with a bounded wait, assembles newline-terminated frames,
/// decodes them leniently (invalid byte sequences are replaced, never fatal)
/// and hands complete lines to the parser. A mid-loop I/O failure flips the
/// state to Disconnected and ends the loop after a fixed pause; restarting
/// is the caller's decision.
async fn read_loop(
    mut reader: ReadHalf<SerialStream>,
    tx: mpsc::Sender<Reading>,
    state: Arc<Mutex<LinkState>>,
    shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 256];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        if *shutdown.borrow() {
            return;
        }

        match timeout(IDLE_POLL, reader.read(&mut buf)).await {
            // Nothing arrived within the poll window; check shutdown again.
            Err(_) => continue,
            Ok(Ok(0)) => {
                error!("Sensor link closed by the device");
                *state.lock().unwrap() = LinkState::Disconnected;
                sleep(READ_ERROR_PAUSE).await;
                return;
            }
            Ok(Ok(n)) => {
                pending.extend_from_slice(&buf[..n]);

                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let frame: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&frame[..pos]);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    // Incomplete samples are routine and deliberately silent.
                    if let Some(reading) = parse_line(line) {
                        if tx.send(reading).await.is_err() {
                            // Pipeline is gone; nothing left to deliver to.
                            *state.lock().unwrap() = LinkState::Disconnected;
                            return;
                        }
                    }
                }

                if pending.len() > MAX_PENDING_BYTES {
                    warn!("Discarding {} unframed bytes from sensor", pending.len());
                    pending.clear();
                }
            }
            Ok(Err(e)) => {
                error!("Error reading from sensor: {}", e);
                *state.lock().unwrap() = LinkState::Disconnected;
                sleep(READ_ERROR_PAUSE).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_serial::UsbPortInfo;

    fn usb_port(product: Option<&str>) -> SerialPortType {
        SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x2341,
            pid: 0x0043,
            serial_number: None,
            manufacturer: None,
            product: product.map(str::to_string),
        })
    }

    #[test]
    fn recognizes_devices_by_usb_product_string() {
        assert!(matches_known_device(
            "/dev/ttyACM0",
            &usb_port(Some("Arduino Uno"))
        ));
        assert!(matches_known_device(
            "/dev/ttyUSB3",
            &usb_port(Some("FT232R USB Serial"))
        ));
    }

    #[test]
    fn recognizes_devices_by_path_pattern() {
        assert!(matches_known_device(
            "/dev/ttyUSB0",
            &SerialPortType::Unknown
        ));
        assert!(matches_known_device(
            "/dev/ttyACM1",
            &SerialPortType::Unknown
        ));
    }

    #[test]
    fn ignores_unrelated_ports() {
        assert!(!matches_known_device("/dev/ttyS0", &SerialPortType::Unknown));
        assert!(!matches_known_device(
            "/dev/ttyS1",
            &usb_port(Some("Modem"))
        ));
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_noop() {
        let mut link = DeviceLink::new(DEFAULT_PORT.to_string(), 9600);
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn start_reading_requires_a_connection() {
        let mut link = DeviceLink::new(DEFAULT_PORT.to_string(), 9600);
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            link.start_reading(tx),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn send_command_requires_a_connection() {
        let mut link = DeviceLink::new(DEFAULT_PORT.to_string(), 9600);
        assert!(matches!(
            link.send_command("RESET").await,
            Err(LinkError::NotConnected)
        ));
    }

    #[test]
    fn status_reflects_initial_state() {
        let link = DeviceLink::new("/dev/ttyACM0".to_string(), 9600);
        let status = link.status();
        assert!(!status.connected);
        assert_eq!(status.state, LinkState::Disconnected);
        assert_eq!(status.port, "/dev/ttyACM0");
        assert_eq!(status.baud_rate, 9600);
    }
}
