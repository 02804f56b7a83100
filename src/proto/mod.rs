//! # Wire Protocol Module
//!
//! Packets exchanged between the collector and the receiver over the
//! half-duplex radio link.
//!
//! This module handles:
//! - Report, data request and data packet layouts
//! - Packet validation (version, magic, declared size)
//! - Link framing with a CRC-16 checksum

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod crc;

pub use decoder::Reception;
pub use protocol::{DataPacket, DataRequestPacket, Packet, PacketType, ReportPacket, Status};
