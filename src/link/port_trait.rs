//! Byte-level seam between the serial radio and the device it talks to

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte pipe to a radio modem
#[async_trait]
pub trait ModemPort: Send {
    /// Hand one complete frame to the modem. Returns once it is flushed.
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Read whatever the modem has, waiting for at least one byte.
    /// `Ok(0)` means the device went away.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Any async byte stream used as a modem port: a serial device, or an
/// in-memory duplex pipe in tests
#[derive(Debug)]
pub struct StreamPort<S> {
    stream: S,
}

impl<S> StreamPort<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

/// Modem port on a real serial device
pub type SerialPort = StreamPort<tokio_serial::SerialStream>;

#[async_trait]
impl<S> ModemPort for StreamPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }
}
