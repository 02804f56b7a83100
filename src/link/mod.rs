//! # Radio Link Module
//!
//! Half-duplex packet radio shared by the collector and the receiver.
//!
//! This module handles:
//! - The `Radio` trait: transmit one packet, or wait for one with a timeout
//! - A radio modem attached to a serial port
//! - An in-process simulated air with loss and corruption

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
pub use crate::proto::Reception;

pub mod port_trait;
pub mod serial;
pub mod sim;

/// Half-duplex packet radio
///
/// `receive` is the only place a node waits for the outside world; a missed
/// packet and a timeout look the same to the caller.
#[async_trait]
pub trait Radio: Send {
    /// Send one packet. Returns once the frame is on the air.
    async fn transmit(&mut self, packet: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next frame. `Ok(None)` on timeout.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Reception>>;
}
