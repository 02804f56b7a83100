//! # Serial Radio Modem
//!
//! Radio modem attached over a serial port (transparent half-duplex
//! UART radios). Packets are carried in CRC-protected link frames.
//!
//! This module handles:
//! - Opening the modem's serial port, trying a list of device paths
//! - Framing outgoing packets
//! - Splitting the incoming byte stream into frames

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use super::port_trait::{ModemPort, SerialPort, StreamPort};
use super::{Radio, Reception};
use crate::error::{PwmonError, Result};
use crate::proto::decoder::FrameDecoder;
use crate::proto::encoder::encode_frame;

/// Default modem baud rate
pub const MODEM_BAUD_RATE: u32 = 115_200;

/// Default modem device paths to try (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyUSB0", // USB-to-serial adapters (FTDI, CP210x)
    "/dev/ttyACM0", // USB CDC devices
];

/// Radio modem on a serial port
pub struct SerialRadio<P: ModemPort = SerialPort> {
    port: P,
    device_path: String,
    decoder: FrameDecoder,
    frames: VecDeque<Reception>,
}

impl<P: ModemPort> std::fmt::Debug for SerialRadio<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialRadio")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl SerialRadio<SerialPort> {
    /// Open the modem with custom device paths
    ///
    /// # Errors
    ///
    /// Returns `SerialPortNotFound` if none of the paths can be opened
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Successfully opened radio modem at {}", path);
                    return Ok(Self::with_port(StreamPort::new(port), path));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(PwmonError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port, 8N1 without flow control
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| PwmonError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }
}

impl<P: ModemPort> SerialRadio<P> {
    /// Wrap an already opened port
    pub fn with_port(port: P, device_path: &str) -> Self {
        Self {
            port,
            device_path: device_path.to_string(),
            decoder: FrameDecoder::new(),
            frames: VecDeque::new(),
        }
    }

    /// Path of the serial device
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

#[async_trait]
impl<P: ModemPort> Radio for SerialRadio<P> {
    async fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        let frame = encode_frame(packet);

        self.port
            .send(&frame)
            .await
            .map_err(|e| PwmonError::Serial(format!("Failed to write frame: {}", e)))?;

        debug!("Sent frame ({} bytes)", frame.len());
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Reception>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];

        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }

            let n = match timeout_at(deadline, self.port.recv(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(PwmonError::LinkClosed),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(PwmonError::Serial(format!("Failed to read: {}", e)));
                }
            };

            self.decoder.push(&chunk[..n]);
            while let Some(frame) = self.decoder.next_frame() {
                self.frames.push_back(frame);
            }
        }
    }
}
