//! # Operator Console
//!
//! Line-oriented commands, dispatched on the first character:
//!
//! | Command   | Action                                        |
//! |-----------|-----------------------------------------------|
//! | `r`       | last report and reception statistics          |
//! | `u`       | collector uptime in seconds                   |
//! | `s`       | start a data sync                             |
//! | `q`       | sync status                                   |
//! | `qd`      | sync status and one assembled page, if ready  |
//! | `p <idx>` | transfer status of one page                   |
//! | `?`       | help                                          |

use std::fmt::Write as _;
use tokio::time::Instant;

use super::Receiver;
use crate::storage::history::unpack_item;
use crate::storage::layout::{Domain, PageImage, DATA_PAGES};

/// Watts per logged power unit
const POWER_SCALE: f64 = 0.2;

/// Volts per logged battery unit
const VBATT_SCALE: f64 = 0.0001;

/// Parsed console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Report,
    Uptime,
    Start,
    Status,
    StatusAndPage,
    Page(usize),
    Help,
}

impl Command {
    /// Parse one input line. Returns `None` for unknown commands.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let mut chars = line.chars();
        match (chars.next()?, chars.next()) {
            ('r', None) => Some(Command::Report),
            ('u', None) => Some(Command::Uptime),
            ('s', None) => Some(Command::Start),
            ('q', None) => Some(Command::Status),
            ('q', Some('d')) if line.len() == 2 => Some(Command::StatusAndPage),
            ('p', _) => line[1..].trim().parse().ok().map(Command::Page),
            ('?', None) => Some(Command::Help),
            _ => None,
        }
    }
}

/// Console reply: text for the operator, plus the page handed out by `qd`
#[derive(Debug, Default)]
pub struct Reply {
    pub text: String,
    pub page: Option<PageImage>,
}

impl Reply {
    fn text(text: String) -> Self {
        Self { text, page: None }
    }
}

/// Run one console line against the receiver
pub fn execute(line: &str, receiver: &mut Receiver, now: Instant) -> Reply {
    let Some(command) = Command::parse(line) else {
        return Reply::text("invalid command, send ? to get help".to_string());
    };
    match command {
        Command::Report => Reply::text(report_text(receiver, now)),
        Command::Uptime => Reply::text(match receiver
            .stats()
            .collector_uptime(now, receiver.measuring_period())
        {
            Some(uptime) => uptime.as_secs().to_string(),
            None => String::new(),
        }),
        Command::Start => {
            receiver.start_sync(now);
            Reply::text(status_text(receiver))
        }
        Command::Status => Reply::text(status_text(receiver)),
        Command::StatusAndPage => {
            let page = receiver.take_ready_page(now);
            let mut text = status_text(receiver);
            if let Some(page) = &page {
                let _ = write!(text, "\n{}", page_summary(page));
            }
            Reply { text, page }
        }
        Command::Page(idx) => Reply::text(page_text(receiver, idx)),
        Command::Help => Reply::text(HELP.to_string()),
    }
}

const HELP: &str = " r  - print last report and reception stat
 u  - get collector uptime in seconds
 s  - start data transfer
 q  - query data transfer status
 qd - query data transfer status and data page if available
 p <idx> - query transfer status of one page
 ?  - this help";

fn report_text(receiver: &Receiver, now: Instant) -> String {
    let stats = receiver.stats();
    let mut text = String::new();
    match (stats.last_report(), stats.last_report_age(now)) {
        (Some(report), Some(age)) => {
            let _ = writeln!(text, "status = {:#04x}", report.status.0);
            let _ = writeln!(text, "PW     = {:.1}", POWER_SCALE * f64::from(report.power));
            let _ = writeln!(text, "Vbatt  = {:.4}", VBATT_SCALE * f64::from(report.vbatt));
            let _ = writeln!(text, "SN     = {}", report.sn);
            let _ = writeln!(text, "{} pages used", report.page_bitmap.count_ones());
            let _ = writeln!(text, "{} report packets received", stats.reports);
            let _ = writeln!(text, "last packet was received {} sec ago", age.as_secs());
        }
        _ => {
            let _ = writeln!(text, "no valid reports received");
        }
    }
    let _ = write!(
        text,
        "total packets received: {} ({}% good), {} crc errors, {} invalid, {} stale",
        stats.total,
        stats.good_percent(),
        stats.crc_errors,
        stats.invalid,
        stats.stale_fragments
    );
    text
}

fn status_text(receiver: &Receiver) -> String {
    let sync = receiver.sync();
    format!(
        "{} ({}), {} pending, {} ready",
        sync.status().name(),
        sync.status().code(),
        sync.pending(),
        sync.ready_pages()
    )
}

fn page_text(receiver: &Receiver, idx: usize) -> String {
    if idx >= DATA_PAGES {
        return format!("page index must be below {}", DATA_PAGES);
    }
    let sync = receiver.sync();
    let status = sync
        .page_status(idx)
        .map(|s| format!("{:?}", s))
        .unwrap_or_default();
    match sync.page_header(idx) {
        Some(header) => format!(
            "page {}: {} domain={} sn={} unused={:#04x}",
            idx, status, header.domain, header.sn, header.unused_fragments.0
        ),
        None => format!("page {}: {}", idx, status),
    }
}

fn page_summary(page: &PageImage) -> String {
    let domain = Domain::from_u8(page.header.domain)
        .map(Domain::name)
        .unwrap_or("unknown");
    let items: Vec<_> = page.items().collect();
    let first = items
        .first()
        .map(|&(_, item)| format!("{:?}", unpack_item(item)))
        .unwrap_or_default();
    format!(
        "page {} {} sn={} items={} first={}",
        page.header.page_idx,
        domain,
        page.header.sn,
        items.len(),
        first
    )
}
