//! # Packet Decoder
//!
//! Validates and decodes received packets and link frames.
//!
//! A packet is rejected unless its version, magic, type and declared size all
//! match, and its length equals the fixed size for its type. Rejected packets
//! are noise as far as the protocol is concerned; callers count and drop them.

use bytes::Buf;

use super::crc::crc16_ccitt;
use super::encoder::{FRAME_OVERHEAD, FRAME_SYNC_BYTE};
use super::protocol::*;
use crate::bitmap::FragmentMask;
use crate::error::{PwmonError, Result};
use crate::storage::layout::{PageBitmap, PageHeader, DATA_PAGES, FRAGMENTS, FRAGMENT_SIZE, PAGE_BITMAP_SIZE, PAGE_HEADER_SIZE};

/// One frame as delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reception {
    pub payload: Vec<u8>,
    /// Link CRC matched
    pub crc_ok: bool,
}

/// Decode a complete packet
///
/// # Errors
///
/// Returns `PwmonError::Protocol` if:
/// - Packet is shorter than the common header
/// - Magic, version or type is wrong
/// - Declared or actual size does not match the type
/// - A data packet names a page or fragment outside the layout
pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    let header = decode_header(bytes)?;
    let mut buf = &bytes[PACKET_HEADER_SIZE..];

    match header.packet_type {
        PacketType::Report => {
            let sn = buf.get_u32_le();
            let power = buf.get_u16_le();
            let vbatt = buf.get_u16_le();
            let mut bitmap = [0u8; PAGE_BITMAP_SIZE];
            buf.copy_to_slice(&mut bitmap);
            Ok(Packet::Report(ReportPacket {
                status: header.status,
                sn,
                power,
                vbatt,
                page_bitmap: PageBitmap::from_bytes(bitmap),
            }))
        }
        PacketType::DataRequest => {
            let cookie = buf.get_u32_le();
            let mut fragments = [FragmentMask::EMPTY; DATA_PAGES];
            for mask in fragments.iter_mut() {
                *mask = FragmentMask(buf.get_u8());
            }
            Ok(Packet::DataRequest(DataRequestPacket {
                status: header.status,
                cookie,
                fragments,
            }))
        }
        PacketType::Data => {
            let cookie = buf.get_u32_le();
            let mut raw_header = [0u8; PAGE_HEADER_SIZE];
            buf.copy_to_slice(&mut raw_header);
            let page_header = PageHeader::from_bytes(&raw_header);
            if page_header.page_idx as usize >= DATA_PAGES {
                return Err(PwmonError::Protocol(format!(
                    "Data packet for page {} outside layout",
                    page_header.page_idx
                )));
            }
            if page_header.fragment as usize >= FRAGMENTS {
                return Err(PwmonError::Protocol(format!(
                    "Data packet for fragment {} outside page",
                    page_header.fragment
                )));
            }
            let mut data = [0u8; FRAGMENT_SIZE];
            buf.copy_to_slice(&mut data);
            Ok(Packet::Data(DataPacket {
                status: header.status,
                cookie,
                page_header,
                data,
            }))
        }
    }
}

/// Validate the common header against the packet length
pub fn decode_header(bytes: &[u8]) -> Result<PacketHeader> {
    if bytes.len() < PACKET_HEADER_SIZE {
        return Err(PwmonError::Protocol(format!(
            "Packet too short: {} bytes",
            bytes.len()
        )));
    }

    let mut buf = bytes;
    let size = buf.get_u8() as usize;
    let version = buf.get_u8();
    let raw_type = buf.get_u8();
    let status = Status(buf.get_u8());
    let magic = buf.get_u32_le();

    if magic != PROTOCOL_MAGIC {
        return Err(PwmonError::Protocol(format!("Invalid magic: 0x{:08X}", magic)));
    }
    if version != PROTOCOL_VERSION {
        return Err(PwmonError::Protocol(format!("Unsupported version: {}", version)));
    }
    let packet_type = PacketType::from_u8(raw_type)
        .ok_or_else(|| PwmonError::Protocol(format!("Unknown packet type: {}", raw_type)))?;

    let expected = packet_type.packet_size();
    if size + 1 != expected || bytes.len() != expected {
        return Err(PwmonError::Protocol(format!(
            "{:?} size mismatch: declared {}, received {}, expected {}",
            packet_type,
            size + 1,
            bytes.len(),
            expected
        )));
    }

    Ok(PacketHeader { packet_type, status })
}

/// Decode one complete link frame
///
/// Returns `None` if the bytes are not framed at all (bad sync byte or
/// length). A framed payload with a bad CRC is still returned, marked.
pub fn decode_frame(frame: &[u8]) -> Option<Reception> {
    if frame.len() < FRAME_OVERHEAD || frame[0] != FRAME_SYNC_BYTE {
        return None;
    }
    let len = frame[1] as usize;
    if frame.len() != len + FRAME_OVERHEAD {
        return None;
    }
    let received_crc = u16::from_le_bytes([frame[2 + len], frame[3 + len]]);
    let crc_ok = crc16_ccitt(&frame[1..2 + len]) == received_crc;
    Some(Reception {
        payload: frame[2..2 + len].to_vec(),
        crc_ok,
    })
}

/// Streaming frame splitter for byte-oriented links
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, discarding bytes before a sync byte
    pub fn next_frame(&mut self) -> Option<Reception> {
        loop {
            match self.buf.iter().position(|&b| b == FRAME_SYNC_BYTE) {
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            let total = self.buf[1] as usize + FRAME_OVERHEAD;
            if self.buf.len() < total {
                return None;
            }
            let frame: Vec<u8> = self.buf.drain(..total).collect();
            match decode_frame(&frame) {
                Some(rx) if rx.crc_ok => return Some(rx),
                Some(rx) => {
                    // The sync byte may have been payload; rescan from the
                    // byte after it and report the damaged frame.
                    self.buf.splice(0..0, frame[1..].iter().copied());
                    return Some(rx);
                }
                None => continue,
            }
        }
    }
}
