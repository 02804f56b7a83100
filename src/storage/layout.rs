//! # Page Layout
//!
//! Build-time layout of the history region: page geometry, the page header,
//! and the table of data domains with their page runs.

use crate::bitmap::{Bitmap, FragmentMask};
use crate::flash::ERASED_WORD;

/// Size of one flash page (erase unit)
pub const PAGE_SIZE: usize = 1024;

/// Independently committable fragments per page
pub const FRAGMENTS: usize = 8;

/// Size of one fragment
pub const FRAGMENT_SIZE: usize = PAGE_SIZE / FRAGMENTS;

/// Size of the page header
pub const PAGE_HEADER_SIZE: usize = 8;

/// 32-bit items per page
pub const PAGE_ITEMS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 4;

/// Pages per domain
pub const FAST_PW_PAGES: usize = 200; // ~ 2 weeks
pub const SLOW_PW_PAGES: usize = 20; // ~ 1 year
pub const VBATT_PAGES: usize = 4; // ~ 2 weeks

/// Pages in the whole history region
pub const DATA_PAGES: usize = FAST_PW_PAGES + SLOW_PW_PAGES + VBATT_PAGES;

/// Bytes needed for one bit per page
pub const PAGE_BITMAP_SIZE: usize = DATA_PAGES / 8;

/// Nominal measuring period in seconds
pub const MEASURING_PERIOD_S: u32 = 12;

/// Used-page bitmap over the whole region
pub type PageBitmap = Bitmap<PAGE_BITMAP_SIZE>;

const _: () = assert!(DATA_PAGES % 8 == 0);
const _: () = assert!(DATA_PAGES <= 256, "page index must fit in one byte");
const _: () = assert!(FRAGMENT_SIZE % 4 == 0);

/// Logical data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Domain {
    /// Power, one half-item per measurement
    FastPower = 0,
    /// Hourly power averages
    SlowPower = 1,
    /// Battery voltage, every 10 minutes
    Battery = 2,
}

/// Placement and decimation of one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLayout {
    pub domain: Domain,
    pub first_page: usize,
    pub page_count: usize,
    /// Raw samples averaged into one half-item
    pub item_samples: u32,
}

/// Every domain in page order
pub const DOMAINS: [DomainLayout; 3] = [
    DomainLayout {
        domain: Domain::FastPower,
        first_page: 0,
        page_count: FAST_PW_PAGES,
        item_samples: 1,
    },
    DomainLayout {
        domain: Domain::SlowPower,
        first_page: FAST_PW_PAGES,
        page_count: SLOW_PW_PAGES,
        item_samples: 3600 / MEASURING_PERIOD_S,
    },
    DomainLayout {
        domain: Domain::Battery,
        first_page: FAST_PW_PAGES + SLOW_PW_PAGES,
        page_count: VBATT_PAGES,
        item_samples: 600 / MEASURING_PERIOD_S,
    },
];

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::FastPower, Domain::SlowPower, Domain::Battery];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Domain::FastPower),
            1 => Some(Domain::SlowPower),
            2 => Some(Domain::Battery),
            _ => None,
        }
    }

    pub fn layout(self) -> &'static DomainLayout {
        &DOMAINS[self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            Domain::FastPower => "fast_pw",
            Domain::SlowPower => "slow_pw",
            Domain::Battery => "vbatt",
        }
    }
}

/// Header stored at the start of every page and echoed in data packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub domain: u8,
    pub page_idx: u8,
    /// Bit `i` set while fragment `i` holds nothing trustworthy
    pub unused_fragments: FragmentMask,
    /// Fragment carried by a data packet; erased on stored pages
    pub fragment: u8,
    /// Sequence number of the first item on the page
    pub sn: u32,
}

impl PageHeader {
    /// Header written when a page is started: only the header's own fragment
    /// is marked used.
    pub fn initial(domain: Domain, page_idx: usize, sn: u32) -> Self {
        Self {
            domain: domain as u8,
            page_idx: page_idx as u8,
            unused_fragments: FragmentMask(!1),
            fragment: 0xFF,
            sn,
        }
    }

    /// First header word as stored in flash
    pub fn tag_word(&self) -> u32 {
        u32::from_le_bytes([
            self.domain,
            self.page_idx,
            self.unused_fragments.0,
            self.fragment,
        ])
    }

    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.tag_word().to_le_bytes());
        bytes[4..].copy_from_slice(&self.sn.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; PAGE_HEADER_SIZE]) -> Self {
        Self {
            domain: bytes[0],
            page_idx: bytes[1],
            unused_fragments: FragmentMask(bytes[2]),
            fragment: bytes[3],
            sn: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// True for a page that has not been started since its last erase
    pub fn is_erased(&self) -> bool {
        self.sn == ERASED_WORD
    }
}

/// Byte offset of item `idx` inside a page
pub const fn item_offset(idx: usize) -> usize {
    PAGE_HEADER_SIZE + idx * 4
}

/// Fragment holding item `idx`
pub const fn item_fragment(idx: usize) -> usize {
    (item_offset(idx) + 3) / FRAGMENT_SIZE
}

/// Full page image assembled by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub header: PageHeader,
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl PageImage {
    /// Committed items in page order. Items in uncommitted fragments are
    /// skipped, as are words that still read as erased flash.
    pub fn items(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        (0..PAGE_ITEMS).filter_map(move |idx| {
            if self.header.unused_fragments.contains(item_fragment(idx)) {
                return None;
            }
            let off = item_offset(idx);
            let word = u32::from_le_bytes([
                self.data[off],
                self.data[off + 1],
                self.data[off + 2],
                self.data[off + 3],
            ]);
            (word != ERASED_WORD).then_some((idx, word))
        })
    }
}
