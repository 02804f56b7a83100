//! # Collector Radio Loop
//!
//! Low duty cycle: wake on the sampling tick, measure, broadcast a report,
//! listen once. A data request switches into the connection loop, which
//! alternates draining fragments with heartbeat reports until the receiver
//! goes quiet. The sampling tick always preempts serving.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use super::sampler::Sampler;
use super::{Collector, TickOutcome};
use crate::error::Result;
use crate::flash::Flash;
use crate::link::Radio;
use crate::proto::decoder::decode_packet;
use crate::proto::encoder::{encode_data, encode_report};
use crate::proto::{DataRequestPacket, Packet, Status};

/// Radio timing of the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Sampling tick period
    pub measuring_period: Duration,
    /// How long to listen for a request after each report
    pub listen_timeout: Duration,
    /// Silent listens before a connection is dropped
    pub listen_retries: u32,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            measuring_period: Duration::from_secs(12),
            listen_timeout: Duration::from_millis(50),
            listen_retries: 3,
        }
    }
}

/// Counters kept by the collector loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub reports_sent: u64,
    pub fragments_sent: u64,
    pub requests_received: u64,
    pub connections: u64,
}

/// The collector node driving its radio
pub struct CollectorLink<F: Flash, R: Radio, S: Sampler> {
    collector: Collector<F>,
    radio: R,
    sampler: S,
    timing: LinkTiming,
    next_tick: Instant,
    stats: CollectorStats,
}

impl<F: Flash + Send, R: Radio, S: Sampler> CollectorLink<F, R, S> {
    /// The first tick fires one measuring period from now
    pub fn new(collector: Collector<F>, radio: R, sampler: S, timing: LinkTiming) -> Self {
        Self {
            collector,
            radio,
            sampler,
            timing,
            next_tick: Instant::now() + timing.measuring_period,
            stats: CollectorStats::default(),
        }
    }

    pub fn collector(&self) -> &Collector<F> {
        &self.collector
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Run until an error occurs
    ///
    /// # Errors
    ///
    /// Radio failures and storage invariant violations end the loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            period_ms = self.timing.measuring_period.as_millis() as u64,
            "collector loop started"
        );
        loop {
            self.step().await?;
        }
    }

    /// Wait for the next sampling tick and handle it, including any
    /// connection that follows
    pub async fn step(&mut self) -> Result<()> {
        sleep_until(self.next_tick).await;
        self.next_tick += self.timing.measuring_period;

        let outcome = self.collector.measure(&mut self.sampler).await?;
        if outcome != TickOutcome::Measured {
            trace!(?outcome, sn = self.collector.data_sn(), "no report this tick");
            return Ok(());
        }

        let report = self.collector.report(Status::NEW_SAMPLE);
        self.radio.transmit(&encode_report(&report)).await?;
        self.stats.reports_sent += 1;
        if report.status.is_conserving() {
            return Ok(());
        }

        if let Some(request) = self.listen().await? {
            self.serve(request).await?;
        }
        Ok(())
    }

    /// Listen for a data request until the listen window closes. Anything
    /// else heard meanwhile is ignored.
    async fn listen(&mut self) -> Result<Option<DataRequestPacket>> {
        let deadline = Instant::now() + self.timing.listen_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(rx) = self.radio.receive(deadline - now).await? else {
                return Ok(None);
            };
            if !rx.crc_ok {
                trace!("dropped frame with bad CRC");
                continue;
            }
            match decode_packet(&rx.payload) {
                Ok(Packet::DataRequest(request)) => {
                    self.stats.requests_received += 1;
                    return Ok(Some(request));
                }
                Ok(other) => trace!(kind = ?other.packet_type(), "ignored packet"),
                Err(e) => trace!("dropped packet: {}", e),
            }
        }
    }

    /// Connection loop: drain, heartbeat, listen, until the receiver stops
    /// asking or the next tick is due
    async fn serve(&mut self, request: DataRequestPacket) -> Result<()> {
        self.stats.connections += 1;
        debug!(cookie = request.cookie, "connection opened");
        self.collector.accept_request(request);
        let mut silent = 0;

        loop {
            while Instant::now() < self.next_tick {
                let Some(packet) = self.collector.next_data_packet()? else {
                    break;
                };
                self.radio.transmit(&encode_data(&packet)).await?;
                self.stats.fragments_sent += 1;
            }
            if Instant::now() >= self.next_tick {
                debug!("serving preempted by sampling tick");
                return Ok(());
            }

            let heartbeat = self.collector.report(Status::CONNECTED);
            self.radio.transmit(&encode_report(&heartbeat)).await?;
            self.stats.reports_sent += 1;

            match self.listen().await? {
                Some(request) => {
                    self.collector.accept_request(request);
                    silent = 0;
                }
                None => {
                    silent += 1;
                    if silent >= self.timing.listen_retries {
                        debug!(
                            fragments = self.stats.fragments_sent,
                            "connection closed after {} silent listens", silent
                        );
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::FragmentMask;
    use crate::collector::sampler::MockSampler;
    use crate::collector::CollectorParams;
    use crate::flash::RamFlash;
    use crate::link::sim::{pair, AirConfig, SimRadio};
    use crate::proto::encoder::encode_data_request;
    use crate::proto::ReportPacket;
    use crate::storage::layout::{DATA_PAGES, PAGE_SIZE};

    fn sampler(vbatt: u16) -> MockSampler {
        let mut sampler = MockSampler::new();
        sampler.expect_read_battery().returning(move || Ok(vbatt));
        sampler.expect_sample_power().returning(|| Ok(50.0));
        sampler
    }

    fn timing() -> LinkTiming {
        LinkTiming {
            measuring_period: Duration::from_secs(12),
            listen_timeout: Duration::from_millis(50),
            listen_retries: 2,
        }
    }

    fn node(vbatt: u16) -> (CollectorLink<RamFlash, SimRadio, MockSampler>, SimRadio) {
        let (air, peer) = pair(AirConfig::default());
        let collector =
            Collector::new(RamFlash::new(DATA_PAGES, PAGE_SIZE), CollectorParams::default()).unwrap();
        (CollectorLink::new(collector, air, sampler(vbatt), timing()), peer)
    }

    async fn next_packet(peer: &mut SimRadio) -> Option<Packet> {
        let rx = peer.receive(Duration::from_millis(1)).await.unwrap()?;
        Some(decode_packet(&rx.payload).unwrap())
    }

    fn as_report(packet: Option<Packet>) -> ReportPacket {
        match packet {
            Some(Packet::Report(report)) => report,
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_broadcasts_new_sample_report() {
        let (mut link, mut peer) = node(40_000);
        link.step().await.unwrap();

        let report = as_report(next_packet(&mut peer).await);
        assert!(report.status.has(Status::NEW_SAMPLE));
        assert_eq!(report.sn, 1);
        assert_eq!(report.power, 250);
        assert!(next_packet(&mut peer).await.is_none());
        assert_eq!(link.stats().reports_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_report_skips_listen() {
        let (mut link, mut peer) = node(34_000);
        // A request already waiting on the air is not consumed
        peer.transmit(&encode_data_request(&DataRequestPacket::new(1)))
            .await
            .unwrap();
        link.step().await.unwrap();

        let report = as_report(next_packet(&mut peer).await);
        assert!(report.status.has(Status::LOW_BATT));
        assert_eq!(link.stats().requests_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_is_served_then_connection_times_out() {
        let (mut link, mut peer) = node(40_000);
        // Two measurements produce one fast-power item on page 0
        link.step().await.unwrap();
        as_report(next_packet(&mut peer).await);

        let mut request = DataRequestPacket::new(9);
        request.fragments[0] = FragmentMask(0x01);
        request.fragments[1] = FragmentMask::ALL;
        // Answer the next report while the collector is listening
        let answer = async {
            let rx = peer.receive(Duration::from_secs(13)).await.unwrap().unwrap();
            let report = as_report(Some(decode_packet(&rx.payload).unwrap()));
            assert!(report.status.has(Status::NEW_SAMPLE));
            peer.transmit(&encode_data_request(&request)).await.unwrap();
        };
        let (stepped, ()) = tokio::join!(link.step(), answer);
        stepped.unwrap();

        match next_packet(&mut peer).await {
            Some(Packet::Data(data)) => {
                assert_eq!(data.cookie, 9);
                assert_eq!((data.page(), data.fragment()), (0, 0));
                assert!(data.status.has(Status::CONNECTED));
            }
            other => panic!("expected data, got {:?}", other),
        }
        // Page 1 is not in use; then one heartbeat per silent listen
        for _ in 0..2 {
            let heartbeat = as_report(next_packet(&mut peer).await);
            assert!(heartbeat.status.has(Status::CONNECTED));
            assert!(!heartbeat.status.has(Status::NEW_SAMPLE));
        }
        assert!(next_packet(&mut peer).await.is_none());

        let stats = link.stats();
        assert_eq!(stats.fragments_sent, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.reports_sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_after_listen_window_is_not_heard() {
        let (mut link, mut peer) = node(40_000);
        link.step().await.unwrap();
        as_report(next_packet(&mut peer).await);

        // The listen window has closed; this request goes unheard
        tokio::time::advance(Duration::from_millis(100)).await;
        peer.transmit(&encode_data_request(&DataRequestPacket::new(9)))
            .await
            .unwrap();
        link.step().await.unwrap();

        as_report(next_packet(&mut peer).await);
        assert!(next_packet(&mut peer).await.is_none());
        assert_eq!(link.stats().requests_received, 0);
        assert_eq!(link.stats().connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_noise_during_listen_is_ignored() {
        let (mut link, mut peer) = node(40_000);
        peer.transmit(&[0xde, 0xad]).await.unwrap();
        link.step().await.unwrap();
        as_report(next_packet(&mut peer).await);
        assert_eq!(link.stats().connections, 0);
    }
}
