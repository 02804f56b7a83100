//! # Wire Protocol Constants and Types
//!
//! Fixed-layout packets shared by the collector and the receiver.
//! All multi-byte fields are little-endian.

use crate::bitmap::FragmentMask;
use crate::storage::layout::{PageBitmap, PageHeader, DATA_PAGES, FRAGMENT_SIZE, PAGE_BITMAP_SIZE, PAGE_HEADER_SIZE};

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Constant used to reject noise that happens to pass the link CRC
pub const PROTOCOL_MAGIC: u32 = 0x4E4D_5750;

/// Largest packet the radio can carry
pub const MAX_PACKET_SIZE: usize = 255;

/// Common header size: size(1) + version(1) + type(1) + status(1) + magic(4)
pub const PACKET_HEADER_SIZE: usize = 8;

/// Report: header + sn(4) + power(2) + vbatt(2) + page bitmap
pub const REPORT_PACKET_SIZE: usize = PACKET_HEADER_SIZE + 8 + PAGE_BITMAP_SIZE;

/// Data request: header + cookie(4) + one fragment bitmap per page
pub const DATA_REQ_PACKET_SIZE: usize = PACKET_HEADER_SIZE + 4 + DATA_PAGES;

/// Data: header + cookie(4) + page header + one fragment
pub const DATA_PACKET_SIZE: usize = PACKET_HEADER_SIZE + 4 + PAGE_HEADER_SIZE + FRAGMENT_SIZE;

const _: () = assert!(REPORT_PACKET_SIZE <= MAX_PACKET_SIZE);
const _: () = assert!(DATA_REQ_PACKET_SIZE <= MAX_PACKET_SIZE);
const _: () = assert!(DATA_PACKET_SIZE <= MAX_PACKET_SIZE);

/// Packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Report = 0,
    DataRequest = 1,
    Data = 2,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::Report),
            1 => Some(PacketType::DataRequest),
            2 => Some(PacketType::Data),
            _ => None,
        }
    }

    /// Expected total packet length for this kind
    pub fn packet_size(self) -> usize {
        match self {
            PacketType::Report => REPORT_PACKET_SIZE,
            PacketType::DataRequest => DATA_REQ_PACKET_SIZE,
            PacketType::Data => DATA_PACKET_SIZE,
        }
    }
}

/// Collector status flags carried in every header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(pub u8);

impl Status {
    /// Collector is serving a data request
    pub const CONNECTED: u8 = 0x01;
    /// Report carries a fresh measurement
    pub const NEW_SAMPLE: u8 = 0x02;
    /// Battery low: no data transfer
    pub const LOW_BATT: u8 = 0x10;
    /// Battery critical: measurements stopped
    pub const HIBERNATE: u8 = 0x20;
    /// Battery full, charging stopped
    pub const CHARGED: u8 = 0x80;

    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn with(self, flag: u8) -> Self {
        Status(self.0 | flag)
    }

    pub fn without(self, flag: u8) -> Self {
        Status(self.0 & !flag)
    }

    /// Collector is saving energy and will not serve transfers
    pub fn is_conserving(self) -> bool {
        self.has(Self::LOW_BATT) || self.has(Self::HIBERNATE)
    }
}

/// Common packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub status: Status,
}

/// Periodic broadcast from the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPacket {
    pub status: Status,
    /// Data sequence number, incremented every measuring period
    pub sn: u32,
    /// Latest power measurement (0.2 W units)
    pub power: u16,
    /// Latest battery voltage (0.1 mV units)
    pub vbatt: u16,
    /// Pages currently holding data
    pub page_bitmap: PageBitmap,
}

/// Fragment request from the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequestPacket {
    pub status: Status,
    /// Echoed in every data packet served for this request
    pub cookie: u32,
    /// Fragments wanted, one mask per page
    pub fragments: [FragmentMask; DATA_PAGES],
}

impl DataRequestPacket {
    pub fn new(cookie: u32) -> Self {
        Self {
            status: Status::default(),
            cookie,
            fragments: [FragmentMask::EMPTY; DATA_PAGES],
        }
    }

    /// Total number of fragments requested
    pub fn fragment_count(&self) -> usize {
        self.fragments.iter().map(|m| m.count()).sum()
    }
}

/// One page fragment served by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub status: Status,
    pub cookie: u32,
    /// Stored page header; `fragment` names the fragment carried
    pub page_header: PageHeader,
    pub data: [u8; FRAGMENT_SIZE],
}

impl DataPacket {
    pub fn page(&self) -> usize {
        self.page_header.page_idx as usize
    }

    pub fn fragment(&self) -> usize {
        self.page_header.fragment as usize
    }
}

/// Any decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Report(ReportPacket),
    DataRequest(DataRequestPacket),
    Data(DataPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Report(_) => PacketType::Report,
            Packet::DataRequest(_) => PacketType::DataRequest,
            Packet::Data(_) => PacketType::Data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_sizes() {
        assert_eq!(REPORT_PACKET_SIZE, 44);
        assert_eq!(DATA_REQ_PACKET_SIZE, 236);
        assert_eq!(DATA_PACKET_SIZE, 148);
    }

    #[test]
    fn test_packet_type_round_trip() {
        for t in [PacketType::Report, PacketType::DataRequest, PacketType::Data] {
            assert_eq!(PacketType::from_u8(t as u8), Some(t));
        }
        assert_eq!(PacketType::from_u8(3), None);
    }

    #[test]
    fn test_status_flags() {
        let status = Status::default().with(Status::LOW_BATT).with(Status::NEW_SAMPLE);
        assert!(status.is_conserving());
        assert!(status.has(Status::NEW_SAMPLE));
        assert!(!status.without(Status::LOW_BATT).is_conserving());
        assert!(Status(Status::HIBERNATE).is_conserving());
    }

    #[test]
    fn test_request_fragment_count() {
        let mut req = DataRequestPacket::new(1);
        req.fragments[0] = FragmentMask(0x01);
        req.fragments[5] = FragmentMask(0xFF);
        assert_eq!(req.fragment_count(), 9);
    }
}
