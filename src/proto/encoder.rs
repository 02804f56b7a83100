//! # Packet Encoder
//!
//! Serializes packets into their fixed little-endian layout and wraps them
//! into link frames.

use bytes::{BufMut, BytesMut};

use super::crc::crc16_ccitt;
use super::protocol::*;
use crate::storage::layout::PageHeader;

/// Link frame sync byte
pub const FRAME_SYNC_BYTE: u8 = 0xA5;

/// Frame overhead: sync(1) + length(1) + crc(2)
pub const FRAME_OVERHEAD: usize = 4;

/// Encode any packet
///
/// # Examples
///
/// ```
/// use pwmon::proto::encoder::encode_packet;
/// use pwmon::proto::protocol::{DataRequestPacket, Packet, DATA_REQ_PACKET_SIZE};
///
/// let bytes = encode_packet(&Packet::DataRequest(DataRequestPacket::new(7)));
/// assert_eq!(bytes.len(), DATA_REQ_PACKET_SIZE);
/// ```
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    match packet {
        Packet::Report(p) => encode_report(p),
        Packet::DataRequest(p) => encode_data_request(p),
        Packet::Data(p) => encode_data(p),
    }
}

pub fn encode_report(packet: &ReportPacket) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(REPORT_PACKET_SIZE);
    put_header(&mut buf, PacketType::Report, packet.status);
    buf.put_u32_le(packet.sn);
    buf.put_u16_le(packet.power);
    buf.put_u16_le(packet.vbatt);
    buf.put_slice(packet.page_bitmap.as_bytes());
    buf.to_vec()
}

pub fn encode_data_request(packet: &DataRequestPacket) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(DATA_REQ_PACKET_SIZE);
    put_header(&mut buf, PacketType::DataRequest, packet.status);
    buf.put_u32_le(packet.cookie);
    for mask in packet.fragments.iter() {
        buf.put_u8(mask.0);
    }
    buf.to_vec()
}

pub fn encode_data(packet: &DataPacket) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(DATA_PACKET_SIZE);
    put_header(&mut buf, PacketType::Data, packet.status);
    buf.put_u32_le(packet.cookie);
    put_page_header(&mut buf, &packet.page_header);
    buf.put_slice(&packet.data);
    buf.to_vec()
}

/// Size field excludes itself, as the radio's length byte does
fn put_header(buf: &mut BytesMut, packet_type: PacketType, status: Status) {
    buf.put_u8((packet_type.packet_size() - 1) as u8);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(packet_type as u8);
    buf.put_u8(status.0);
    buf.put_u32_le(PROTOCOL_MAGIC);
}

fn put_page_header(buf: &mut BytesMut, header: &PageHeader) {
    buf.put_slice(&header.to_bytes());
}

/// Wrap a packet into a link frame: sync + length + packet + CRC16 (LE)
///
/// The CRC covers the length byte and the packet.
pub fn encode_frame(packet: &[u8]) -> Vec<u8> {
    debug_assert!(packet.len() <= MAX_PACKET_SIZE);
    let mut frame = Vec::with_capacity(packet.len() + FRAME_OVERHEAD);
    frame.push(FRAME_SYNC_BYTE);
    frame.push(packet.len() as u8);
    frame.extend_from_slice(packet);
    let crc = crc16_ccitt(&frame[1..]);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}
