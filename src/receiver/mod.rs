//! # Receiver Module
//!
//! The base station: listens to the collector, runs data syncs on operator
//! request and hands assembled pages to telemetry.
//!
//! This module handles:
//! - Classifying every received frame and keeping reception statistics
//! - Driving the sync state machine from reports and data packets
//! - The operator console
//! - The radio loop

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod console;
pub mod link;
pub mod stats;
pub mod sync;

use crate::link::Reception;
use crate::proto::decoder::decode_packet;
use crate::proto::{DataRequestPacket, Packet};
use crate::storage::layout::MEASURING_PERIOD_S;
use crate::storage::PageImage;
use stats::ReceptionStats;
use sync::{DataOutcome, SyncConfig, SyncSession};

/// Receiver state: statistics plus the sync session
#[derive(Debug)]
pub struct Receiver {
    sync: SyncSession,
    stats: ReceptionStats,
    /// Collector sampling period, for uptime
    measuring_period: Duration,
}

impl Receiver {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            sync: SyncSession::new(config),
            stats: ReceptionStats::new(),
            measuring_period: Duration::from_secs(u64::from(MEASURING_PERIOD_S)),
        }
    }

    /// Use the collector's configured sampling period
    pub fn with_measuring_period(mut self, period: Duration) -> Self {
        self.measuring_period = period;
        self
    }

    pub fn measuring_period(&self) -> Duration {
        self.measuring_period
    }

    pub fn sync(&self) -> &SyncSession {
        &self.sync
    }

    pub fn stats(&self) -> &ReceptionStats {
        &self.stats
    }

    pub fn start_sync(&mut self, now: Instant) {
        self.sync.start(now);
    }

    pub fn take_ready_page(&mut self, now: Instant) -> Option<PageImage> {
        self.sync.take_ready_page(now)
    }

    /// Handle one frame from the radio. Returns the data request to send
    /// back, if the sync wants one.
    pub fn on_reception(&mut self, rx: &Reception, now: Instant) -> Option<DataRequestPacket> {
        self.stats.total += 1;
        if !rx.crc_ok {
            self.stats.crc_errors += 1;
            trace!(len = rx.payload.len(), "frame with bad CRC");
            return None;
        }
        let packet = match decode_packet(&rx.payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.invalid += 1;
                debug!("dropped packet: {}", e);
                return None;
            }
        };
        self.stats.good += 1;

        match packet {
            Packet::Report(report) => {
                self.stats.on_report(&report, now);
                self.sync.on_report(&report, now)
            }
            Packet::Data(data) => {
                if self.sync.on_data(&data, now) == DataOutcome::Stale {
                    self.stats.stale_fragments += 1;
                }
                None
            }
            Packet::DataRequest(request) => {
                trace!(cookie = request.cookie, "request from another receiver");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::encoder::{encode_data_request, encode_report};
    use crate::proto::{ReportPacket, Status};
    use crate::storage::layout::PageBitmap;
    use sync::SyncStatus;

    fn report_rx(sn: u32) -> Reception {
        let mut page_bitmap = PageBitmap::new();
        page_bitmap.set(0);
        Reception {
            payload: encode_report(&ReportPacket {
                status: Status(Status::NEW_SAMPLE),
                sn,
                power: 1,
                vbatt: 40_000,
                page_bitmap,
            }),
            crc_ok: true,
        }
    }

    #[test]
    fn test_classifies_receptions() {
        let now = Instant::now();
        let mut receiver = Receiver::new(SyncConfig::default());

        let mut corrupt = report_rx(1);
        corrupt.crc_ok = false;
        assert!(receiver.on_reception(&corrupt, now).is_none());
        assert!(receiver
            .on_reception(&Reception { payload: vec![1, 2, 3], crc_ok: true }, now)
            .is_none());
        receiver.on_reception(&report_rx(1), now);
        receiver.on_reception(
            &Reception {
                payload: encode_data_request(&DataRequestPacket::new(4)),
                crc_ok: true,
            },
            now,
        );

        let stats = receiver.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.crc_errors, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.good, 2);
        assert_eq!(stats.reports, 1);
    }

    #[test]
    fn test_report_drives_sync() {
        let now = Instant::now();
        let mut receiver = Receiver::new(SyncConfig::default());
        assert!(receiver.on_reception(&report_rx(1), now).is_none());

        receiver.start_sync(now);
        let request = receiver.on_reception(&report_rx(2), now).unwrap();
        assert_eq!(request.fragment_count(), 1);
        assert_eq!(receiver.sync().status(), SyncStatus::ReadingMeta);
    }
}
