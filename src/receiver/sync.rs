//! # Sync State Machine
//!
//! Pulls the collector's log over the half-duplex link. Every report the
//! collector broadcasts is the trigger for the next request; there are no
//! acknowledgements.
//!
//! Two phases:
//! 1. **Metadata**: request fragment 0 of every page in use and capture the
//!    page headers.
//! 2. **Data**: bind free reassembly buffers to pages in ascending order and
//!    request exactly the fragments each header marks as committed.
//!
//! A collector restart (report sequence number below the anchor) fails the
//! whole sync. A page recycled mid-transfer (header `sn` changed) aborts only
//! that page.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bitmap::FragmentMask;
use crate::flash::ERASED_BYTE;
use crate::proto::{DataPacket, DataRequestPacket, ReportPacket};
use crate::storage::layout::{PageHeader, PageImage, DATA_PAGES, FRAGMENT_SIZE, PAGE_SIZE};

/// Reassembly buffers in the pool
pub const DEFAULT_BUFFERS: usize = 16;

/// Time without progress after which a stalled sync fails. Spans more
/// than one report period so a single missed connection is survivable.
pub const DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Sync session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub buffers: usize,
    pub buffer_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            buffers: DEFAULT_BUFFERS,
            buffer_timeout: DEFAULT_BUFFER_TIMEOUT,
        }
    }
}

/// Overall sync status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncStatus {
    None,
    Starting,
    ReadingMeta,
    ReadingData,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn name(self) -> &'static str {
        match self {
            SyncStatus::None => "none",
            SyncStatus::Starting => "starting",
            SyncStatus::ReadingMeta => "reading_meta",
            SyncStatus::ReadingData => "reading_data",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    /// One-byte status code reported on the console
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Transfer status of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Unknown,
    Unused,
    ReadingMeta,
    HasMeta,
    ReadingData,
    HasData,
    Aborted,
}

/// What a data packet did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Captured a header or filled a fragment
    Accepted,
    /// Duplicate, unrequested, or not in a reading phase
    Ignored,
    /// Cookie of an earlier session
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct PageSlot {
    status: PageStatus,
    header: Option<PageHeader>,
    /// Fragments still wanted
    required: FragmentMask,
    buffer: Option<usize>,
}

impl PageSlot {
    const UNKNOWN: PageSlot = PageSlot {
        status: PageStatus::Unknown,
        header: None,
        required: FragmentMask::EMPTY,
        buffer: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Free,
    Reading(usize),
    Ready(usize),
}

#[derive(Debug)]
struct ReassemblyBuffer {
    state: BufferState,
    data: Box<[u8; PAGE_SIZE]>,
}

/// Receiver side of one sync at a time
#[derive(Debug)]
pub struct SyncSession {
    config: SyncConfig,
    status: SyncStatus,
    cookie: u32,
    anchor: u32,
    pages: Vec<PageSlot>,
    buffers: Vec<ReassemblyBuffer>,
    /// Pages in a reading state
    pending: usize,
    /// Next page to consider for binding
    next_page: usize,
    /// Refreshed on every bind, accepted fragment and drain
    deadline: Instant,
}

impl SyncSession {
    pub fn new(config: SyncConfig) -> Self {
        let buffers = (0..config.buffers.max(1))
            .map(|_| ReassemblyBuffer {
                state: BufferState::Free,
                data: Box::new([ERASED_BYTE; PAGE_SIZE]),
            })
            .collect();
        Self {
            config,
            status: SyncStatus::None,
            cookie: 0,
            anchor: 0,
            pages: vec![PageSlot::UNKNOWN; DATA_PAGES],
            buffers,
            pending: 0,
            next_page: 0,
            deadline: Instant::now(),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn page_status(&self, page: usize) -> Option<PageStatus> {
        self.pages.get(page).map(|slot| slot.status)
    }

    /// Captured header of `page`, once known
    pub fn page_header(&self, page: usize) -> Option<PageHeader> {
        self.pages.get(page).and_then(|slot| slot.header)
    }

    /// Sequence number of the report that started the sync
    pub fn anchor(&self) -> u32 {
        self.anchor
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// A sync is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SyncStatus::Starting | SyncStatus::ReadingMeta | SyncStatus::ReadingData
        )
    }

    /// Pages assembled and waiting to be drained
    pub fn ready_pages(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| matches!(b.state, BufferState::Ready(_)))
            .count()
    }

    /// Start a new sync, discarding any previous one
    pub fn start(&mut self, now: Instant) {
        self.cookie = self.cookie.wrapping_add(1);
        self.anchor = 0;
        self.pages.fill(PageSlot::UNKNOWN);
        self.free_buffers();
        self.pending = 0;
        self.next_page = 0;
        self.touch(now);
        self.status = SyncStatus::Starting;
        info!(cookie = self.cookie, "sync started");
    }

    /// Drive the session with a received report. Returns the request to send
    /// back, if any.
    pub fn on_report(&mut self, report: &ReportPacket, now: Instant) -> Option<DataRequestPacket> {
        match self.status {
            SyncStatus::None | SyncStatus::Completed | SyncStatus::Failed => None,
            SyncStatus::Starting => self.begin(report),
            _ if report.sn < self.anchor => {
                let reason = format!(
                    "collector restarted: report sn {} below anchor {}",
                    report.sn, self.anchor
                );
                self.fail(&reason);
                None
            }
            SyncStatus::ReadingMeta => Some(self.request()),
            SyncStatus::ReadingData => self.request_data(now),
        }
    }

    /// Feed a received data packet into the session
    pub fn on_data(&mut self, packet: &DataPacket, now: Instant) -> DataOutcome {
        if !matches!(self.status, SyncStatus::ReadingMeta | SyncStatus::ReadingData) {
            return DataOutcome::Ignored;
        }
        if packet.cookie != self.cookie {
            debug!(cookie = packet.cookie, "stale data packet");
            return DataOutcome::Stale;
        }

        let page = packet.page();
        let fragment = packet.fragment();
        let Some(&slot) = self.pages.get(page) else {
            return DataOutcome::Ignored;
        };
        match (self.status, slot.status) {
            (SyncStatus::ReadingMeta, PageStatus::ReadingMeta) => {
                let mut header = packet.page_header;
                header.fragment = 0xFF;
                self.pages[page] = PageSlot {
                    status: PageStatus::HasMeta,
                    header: Some(header),
                    required: FragmentMask::EMPTY,
                    buffer: None,
                };
                self.release_pending();
                self.touch(now);
                if self.pending == 0 {
                    self.status = SyncStatus::ReadingData;
                    self.next_page = 0;
                    self.free_buffers();
                    info!("page headers received, reading data");
                }
                DataOutcome::Accepted
            }
            (SyncStatus::ReadingData, PageStatus::ReadingData) if slot.required.contains(fragment) => {
                let (Some(header), Some(buffer)) = (slot.header, slot.buffer) else {
                    return DataOutcome::Ignored;
                };
                if packet.page_header.sn != header.sn {
                    warn!(
                        page,
                        expected = header.sn,
                        got = packet.page_header.sn,
                        "page recycled during transfer, aborted"
                    );
                    self.pages[page].status = PageStatus::Aborted;
                    self.pages[page].required = FragmentMask::EMPTY;
                    self.pages[page].buffer = None;
                    self.buffers[buffer].state = BufferState::Free;
                    self.release_pending();
                    self.touch(now);
                    return DataOutcome::Accepted;
                }

                let off = fragment * FRAGMENT_SIZE;
                self.buffers[buffer].data[off..off + FRAGMENT_SIZE].copy_from_slice(&packet.data);
                self.pages[page].required.remove(fragment);
                self.touch(now);
                if self.pages[page].required.is_empty() {
                    self.pages[page].status = PageStatus::HasData;
                    self.buffers[buffer].state = BufferState::Ready(page);
                    self.release_pending();
                    debug!(page, "page complete");
                }
                DataOutcome::Accepted
            }
            _ => DataOutcome::Ignored,
        }
    }

    /// Hand out one assembled page and free its buffer
    pub fn take_ready_page(&mut self, now: Instant) -> Option<PageImage> {
        if !matches!(self.status, SyncStatus::ReadingData | SyncStatus::Completed) {
            return None;
        }
        let buffer = self
            .buffers
            .iter_mut()
            .find(|b| matches!(b.state, BufferState::Ready(_)))?;
        let BufferState::Ready(page) = buffer.state else {
            return None;
        };
        let header = self.pages[page].header?;
        buffer.state = BufferState::Free;
        let data = buffer.data.clone();
        self.pages[page].buffer = None;
        self.touch(now);
        Some(PageImage { header, data })
    }

    /// First report of a session: anchor the epoch and ask for headers
    fn begin(&mut self, report: &ReportPacket) -> Option<DataRequestPacket> {
        if report.status.is_conserving() {
            let reason = format!("collector is saving energy (status {:#04x})", report.status.0);
            self.fail(&reason);
            return None;
        }
        self.anchor = report.sn;
        for (page, slot) in self.pages.iter_mut().enumerate() {
            if report.page_bitmap.get(page) {
                slot.status = PageStatus::ReadingMeta;
                slot.required = FragmentMask::single(0);
                self.pending += 1;
            } else {
                slot.status = PageStatus::Unused;
            }
        }
        if self.pending == 0 {
            self.fail("collector has no pages in use");
            return None;
        }
        info!(anchor = self.anchor, pages = self.pending, "reading page headers");
        self.status = SyncStatus::ReadingMeta;
        Some(self.request())
    }

    fn request_data(&mut self, now: Instant) -> Option<DataRequestPacket> {
        let mut has_free = false;
        if self.next_page < DATA_PAGES {
            for buffer in 0..self.buffers.len() {
                if self.buffers[buffer].state != BufferState::Free {
                    continue;
                }
                has_free = true;
                if !self.attach(buffer, now) {
                    break;
                }
            }
        }
        let scanned = self.next_page >= DATA_PAGES;
        if scanned && self.pending == 0 {
            self.status = SyncStatus::Completed;
            info!(ready = self.ready_pages(), "sync completed");
            return None;
        }
        // Waiting on a buffer to be drained, or on fragments of bound pages
        if (scanned || !has_free) && now > self.deadline {
            let reason = if scanned {
                format!(
                    "{} page(s) got no fragment within {:?}",
                    self.pending, self.config.buffer_timeout
                )
            } else {
                format!("no reassembly buffer freed within {:?}", self.config.buffer_timeout)
            };
            self.fail(&reason);
            return None;
        }
        Some(self.request())
    }

    /// Bind `buffer` to the next page with a known header. Returns false once
    /// every page has been considered.
    fn attach(&mut self, buffer: usize, now: Instant) -> bool {
        while self.next_page < DATA_PAGES {
            let page = self.next_page;
            self.next_page += 1;
            let slot = &mut self.pages[page];
            if slot.status != PageStatus::HasMeta {
                continue;
            }
            let Some(header) = slot.header else {
                continue;
            };
            let required = header.unused_fragments.complement();
            if required.is_empty() {
                warn!(page, "page header marks every fragment unused, skipped");
                slot.status = PageStatus::Aborted;
                continue;
            }
            slot.status = PageStatus::ReadingData;
            slot.required = required;
            slot.buffer = Some(buffer);
            self.pending += 1;
            let buf = &mut self.buffers[buffer];
            buf.state = BufferState::Reading(page);
            buf.data.fill(ERASED_BYTE);
            self.touch(now);
            return true;
        }
        false
    }

    /// Request covering every outstanding fragment
    fn request(&self) -> DataRequestPacket {
        let mut request = DataRequestPacket::new(self.cookie);
        for (mask, slot) in request.fragments.iter_mut().zip(self.pages.iter()) {
            *mask = slot.required;
        }
        request
    }

    fn touch(&mut self, now: Instant) {
        self.deadline = now + self.config.buffer_timeout;
    }

    fn release_pending(&mut self) {
        assert!(self.pending > 0, "sync pending counter underflow");
        self.pending -= 1;
    }

    fn free_buffers(&mut self) {
        for buffer in self.buffers.iter_mut() {
            buffer.state = BufferState::Free;
        }
    }

    fn fail(&mut self, reason: &str) {
        warn!(cookie = self.cookie, "sync failed: {}", reason);
        self.status = SyncStatus::Failed;
    }
}
