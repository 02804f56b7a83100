//! Reception statistics and the last report heard

use std::time::Duration;
use tokio::time::Instant;

use crate::proto::{ReportPacket, Status};

/// Counters over everything the receiver has heard
#[derive(Debug, Clone, Default)]
pub struct ReceptionStats {
    /// Frames delivered by the radio
    pub total: u64,
    /// Frames that decoded into a valid packet
    pub good: u64,
    pub crc_errors: u64,
    /// Frames with a good CRC but a malformed packet
    pub invalid: u64,
    /// New-sample reports
    pub reports: u64,
    /// Data packets carrying an earlier session's cookie
    pub stale_fragments: u64,
    last_report: Option<(ReportPacket, Instant)>,
}

impl ReceptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a report. Heartbeats without a new sample are not counted.
    pub fn on_report(&mut self, report: &ReportPacket, now: Instant) {
        if report.status.has(Status::NEW_SAMPLE) {
            self.reports += 1;
            self.last_report = Some((report.clone(), now));
        }
    }

    pub fn last_report(&self) -> Option<&ReportPacket> {
        self.last_report.as_ref().map(|(report, _)| report)
    }

    /// Time since the last new-sample report
    pub fn last_report_age(&self, now: Instant) -> Option<Duration> {
        self.last_report
            .as_ref()
            .map(|(_, at)| now.saturating_duration_since(*at))
    }

    /// Collector uptime: one `period` per sequence number plus the time
    /// since the report arrived
    pub fn collector_uptime(&self, now: Instant, period: Duration) -> Option<Duration> {
        let (report, at) = self.last_report.as_ref()?;
        Some(period * report.sn + now.saturating_duration_since(*at))
    }

    /// Share of frames that decoded cleanly, in percent
    pub fn good_percent(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.good * 100 / self.total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::PageBitmap;

    fn report(status: u8, sn: u32) -> ReportPacket {
        ReportPacket {
            status: Status(status),
            sn,
            power: 10,
            vbatt: 38_000,
            page_bitmap: PageBitmap::new(),
        }
    }

    #[test]
    fn test_heartbeats_are_not_counted() {
        let now = Instant::now();
        let mut stats = ReceptionStats::new();
        stats.on_report(&report(Status::CONNECTED, 5), now);
        assert_eq!(stats.reports, 0);
        assert!(stats.last_report().is_none());

        stats.on_report(&report(Status::NEW_SAMPLE, 6), now);
        assert_eq!(stats.reports, 1);
        assert_eq!(stats.last_report().unwrap().sn, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_adds_report_age() {
        let mut stats = ReceptionStats::new();
        let period = Duration::from_secs(12);
        assert!(stats.collector_uptime(Instant::now(), period).is_none());

        stats.on_report(&report(Status::NEW_SAMPLE, 10), Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;
        let now = Instant::now();
        assert_eq!(stats.last_report_age(now), Some(Duration::from_secs(3)));
        assert_eq!(stats.collector_uptime(now, period), Some(Duration::from_secs(123)));
        assert_eq!(
            stats.collector_uptime(now, Duration::from_millis(500)),
            Some(Duration::from_secs(8))
        );
    }

    #[test]
    fn test_good_percent() {
        let mut stats = ReceptionStats::new();
        assert_eq!(stats.good_percent(), 0);
        stats.total = 8;
        stats.good = 6;
        assert_eq!(stats.good_percent(), 75);
    }
}
