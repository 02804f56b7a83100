//! # Simulated Air
//!
//! Two radios joined by in-process channels. Frames can be dropped or have a
//! bit flipped on the way, so the protocol's retry and CRC paths get
//! exercised without hardware.
//!
//! The radios are half-duplex: once a receive times out the radio is off
//! until the next receive starts, and frames sent in between are lost.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use super::{Radio, Reception};
use crate::error::{PwmonError, Result};
use crate::proto::decoder::decode_frame;
use crate::proto::encoder::encode_frame;

/// Channel impairments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirConfig {
    /// Probability that a frame never arrives
    pub loss: f64,
    /// Probability that an arriving frame has one bit flipped
    pub corruption: f64,
    pub seed: u64,
}

impl Default for AirConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            corruption: 0.0,
            seed: 0,
        }
    }
}

/// Frame on the air, stamped with its send time
type Burst = (Instant, Vec<u8>);

/// One end of the simulated air
#[derive(Debug)]
pub struct SimRadio {
    tx: mpsc::UnboundedSender<Burst>,
    rx: mpsc::UnboundedReceiver<Burst>,
    air: AirConfig,
    rng: StdRng,
    /// Set when a receive times out, cleared by the next receive
    off_since: Option<Instant>,
    /// First frame heard after the radio came back on
    held: Option<Vec<u8>>,
    sent: u64,
    dropped: u64,
    missed: u64,
}

/// Create two radios that hear each other
pub fn pair(air: AirConfig) -> (SimRadio, SimRadio) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let radio = |tx, rx, seed| SimRadio {
        tx,
        rx,
        air,
        rng: StdRng::seed_from_u64(seed),
        off_since: None,
        held: None,
        sent: 0,
        dropped: 0,
        missed: 0,
    };
    (
        radio(a_tx, a_rx, air.seed),
        radio(b_tx, b_rx, air.seed.wrapping_add(1)),
    )
}

impl SimRadio {
    /// Frames transmitted, including dropped ones
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Frames lost on the air
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Frames that arrived while this radio was not receiving
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Throw away frames sent while the radio was off. Frames sent at the
    /// instant it comes back on are still heard.
    fn discard_unheard(&mut self, off_since: Instant) {
        let now = Instant::now();
        while let Ok((sent_at, frame)) = self.rx.try_recv() {
            if sent_at < now {
                self.missed += 1;
                trace!(
                    off_ms = now.saturating_duration_since(off_since).as_millis() as u64,
                    "frame sent while not receiving"
                );
                continue;
            }
            self.held = Some(frame);
            break;
        }
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        self.sent += 1;
        if self.air.loss > 0.0 && self.rng.gen_bool(self.air.loss) {
            self.dropped += 1;
            trace!(len = packet.len(), "frame lost");
            return Ok(());
        }
        let mut frame = encode_frame(packet);
        if self.air.corruption > 0.0 && self.rng.gen_bool(self.air.corruption) {
            // Keep the sync and length bytes so the frame stays delimited
            let byte = self.rng.gen_range(2..frame.len());
            let bit = self.rng.gen_range(0..8);
            frame[byte] ^= 1 << bit;
            trace!(byte, bit, "frame corrupted");
        }
        // Nobody listening is not an error for a broadcast radio
        let _ = self.tx.send((Instant::now(), frame));
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Reception>> {
        if let Some(off_since) = self.off_since.take() {
            self.discard_unheard(off_since);
        }
        if let Some(frame) = self.held.take() {
            return Ok(decode_frame(&frame));
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => {
                self.off_since = Some(Instant::now());
                Ok(None)
            }
            Ok(None) => Err(PwmonError::LinkClosed),
            Ok(Some((_, frame))) => Ok(decode_frame(&frame)),
        }
    }
}
