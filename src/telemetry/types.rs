//! Telemetry record types and page decoding

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PwmonError, Result};
use crate::storage::history::unpack_item;
use crate::storage::layout::{Domain, PageImage};

/// Physical unit per logged code, by domain
pub fn unit_scale(domain: Domain) -> f64 {
    match domain {
        Domain::FastPower | Domain::SlowPower => 0.2,
        Domain::Battery => 0.0001,
    }
}

/// One decoded history sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub page: u8,
    /// Sequence number of the first raw sample averaged into this one
    pub sn: u32,
    /// Logged code
    pub raw: u16,
    /// Watts for power domains, volts for the battery
    pub value: f64,
}

/// Maps collector sequence numbers to wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub report_sn: u32,
    pub report_time: DateTime<Utc>,
    pub period: Duration,
}

impl Timebase {
    /// Timebase from a report heard `age` ago
    pub fn from_report(report_sn: u32, age: Duration, period: Duration) -> Self {
        let age = ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::zero());
        Self {
            report_sn,
            report_time: Utc::now() - age,
            period,
        }
    }

    /// Wall-clock time of sequence number `sn`
    pub fn time_of(&self, sn: u32) -> DateTime<Utc> {
        let ticks = i64::from(self.report_sn) - i64::from(sn);
        let period_ms = self.period.as_millis() as i64;
        self.report_time - ChronoDuration::milliseconds(ticks * period_ms)
    }
}

/// Decode every committed sample of an assembled page
///
/// Items within a page have consecutive sequence numbers, each spanning two
/// averaging windows of the domain.
///
/// # Errors
///
/// Returns `Protocol` if the page header names an unknown domain.
pub fn decode_page(page: &PageImage, timebase: &Timebase) -> Result<Vec<SampleRecord>> {
    let domain = Domain::from_u8(page.header.domain).ok_or_else(|| {
        PwmonError::Protocol(format!(
            "page {} has unknown domain {}",
            page.header.page_idx, page.header.domain
        ))
    })?;
    let item_samples = domain.layout().item_samples;
    let scale = unit_scale(domain);

    let mut records = Vec::new();
    for (idx, item) in page.items() {
        let item_sn = page
            .header
            .sn
            .wrapping_add(idx as u32 * 2 * item_samples);
        for (half, raw) in unpack_item(item).into_iter().enumerate() {
            let sn = item_sn.wrapping_add(half as u32 * item_samples);
            records.push(SampleRecord {
                timestamp: timebase.time_of(sn),
                domain: domain.name().to_string(),
                page: page.header.page_idx,
                sn,
                raw,
                value: f64::from(raw) * scale,
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::{item_offset, PageHeader, PAGE_SIZE};

    fn page(domain: Domain, sn: u32, items: &[u32]) -> PageImage {
        let mut data = Box::new([0xFFu8; PAGE_SIZE]);
        for (i, item) in items.iter().enumerate() {
            data[item_offset(i)..item_offset(i + 1)].copy_from_slice(&item.to_le_bytes());
        }
        PageImage {
            header: PageHeader::initial(domain, 7, sn),
            data,
        }
    }

    fn timebase() -> Timebase {
        Timebase {
            report_sn: 1000,
            report_time: DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            period: Duration::from_secs(12),
        }
    }

    #[test]
    fn test_time_of_counts_back_from_report() {
        let tb = timebase();
        assert_eq!(tb.time_of(1000), tb.report_time);
        assert_eq!(tb.time_of(995), tb.report_time - ChronoDuration::seconds(60));
        assert_eq!(tb.time_of(1001), tb.report_time + ChronoDuration::seconds(12));
    }

    #[test]
    fn test_decode_fast_power_page() {
        let item = 100u32 | (200u32 << 16);
        let records = decode_page(&page(Domain::FastPower, 990, &[item, item]), &timebase()).unwrap();

        assert_eq!(records.len(), 4);
        let sns: Vec<u32> = records.iter().map(|r| r.sn).collect();
        assert_eq!(sns, vec![990, 991, 992, 993]);
        assert_eq!(records[0].raw, 100);
        assert_eq!(records[1].raw, 200);
        assert!((records[0].value - 20.0).abs() < 1e-9);
        assert_eq!(records[0].domain, "fast_pw");
        assert_eq!(records[0].page, 7);
        assert_eq!(
            records[0].timestamp,
            timebase().report_time - ChronoDuration::seconds(120)
        );
    }

    #[test]
    fn test_decode_battery_page_spacing() {
        let item = 40_000u32 | (39_990u32 << 16);
        let records = decode_page(&page(Domain::Battery, 0, &[item, item]), &timebase()).unwrap();
        let sns: Vec<u32> = records.iter().map(|r| r.sn).collect();
        assert_eq!(sns, vec![0, 50, 100, 150]);
        assert!((records[0].value - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_skips_uncommitted_fragments() {
        let mut image = page(Domain::FastPower, 0, &[1; 40]);
        image.header.unused_fragments = crate::bitmap::FragmentMask(0xFE);
        // Only the 30 items of fragment 0 are trusted
        assert_eq!(decode_page(&image, &timebase()).unwrap().len(), 60);
    }

    #[test]
    fn test_decode_rejects_unknown_domain() {
        let mut image = page(Domain::FastPower, 0, &[1]);
        image.header.domain = 9;
        assert!(decode_page(&image, &timebase()).is_err());
    }

    #[test]
    fn test_record_serializes_to_json() {
        let records = decode_page(&page(Domain::SlowPower, 1000, &[5]), &timebase()).unwrap();
        let json = serde_json::to_string(&records[0]).unwrap();
        assert!(json.contains("\"domain\":\"slow_pw\""));
        assert!(json.contains("\"timestamp\":\"2026-01-01T12:00:00Z\""));
        let back: SampleRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, records[0]);
    }
}
