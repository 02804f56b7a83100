//! # Flash Module
//!
//! NOR-style page flash: a page erases to all ones and a word write can only
//! clear bits. The storage layer relies on exactly these semantics to commit
//! page headers and fragment bits without an erase.
//!
//! This module handles:
//! - The `Flash` driver trait
//! - `RamFlash`, an in-memory emulation that enforces bit-clear-only writes

use thiserror::Error;

/// Value of an erased byte
pub const ERASED_BYTE: u8 = 0xFF;

/// Value of an erased word
pub const ERASED_WORD: u32 = u32::MAX;

/// Flash driver errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    /// Page index or byte range outside the device
    #[error("access out of range: page {page}, offset {offset}")]
    OutOfRange { page: usize, offset: usize },

    /// Word write at an unaligned offset
    #[error("misaligned word write at page {page}, offset {offset}")]
    Misaligned { page: usize, offset: usize },

    /// Write would need to turn a 0 bit back into 1
    #[error("write of {word:#010x} over {current:#010x} at page {page}, offset {offset} sets cleared bits")]
    BitSet {
        page: usize,
        offset: usize,
        current: u32,
        word: u32,
    },
}

/// Page-erasable, bit-clearable storage
pub trait Flash {
    /// Size of one erase unit in bytes
    fn page_size(&self) -> usize;

    /// Number of pages on the device
    fn page_count(&self) -> usize;

    /// Read `buf.len()` bytes starting at `offset` inside `page`
    fn read(&self, page: usize, offset: usize, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Reset every byte of `page` to the erased value
    fn erase_page(&mut self, page: usize) -> Result<(), FlashError>;

    /// Program one little-endian word. Only 1 -> 0 transitions are allowed.
    fn write_word(&mut self, page: usize, offset: usize, word: u32) -> Result<(), FlashError>;

    /// Read one little-endian word
    fn read_word(&self, page: usize, offset: usize) -> Result<u32, FlashError> {
        let mut buf = [0u8; 4];
        self.read(page, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// In-memory flash emulation
#[derive(Debug, Clone)]
pub struct RamFlash {
    page_size: usize,
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    writes: u64,
}

impl RamFlash {
    /// Create a fully erased device
    pub fn new(page_count: usize, page_size: usize) -> Self {
        Self {
            page_size,
            data: vec![ERASED_BYTE; page_count * page_size],
            erase_counts: vec![0; page_count],
            writes: 0,
        }
    }

    /// Number of times `page` has been erased
    pub fn erase_count(&self, page: usize) -> u32 {
        self.erase_counts.get(page).copied().unwrap_or(0)
    }

    /// Total word writes since creation
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    fn range(&self, page: usize, offset: usize, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        if page >= self.erase_counts.len() || offset + len > self.page_size {
            return Err(FlashError::OutOfRange { page, offset });
        }
        let start = page * self.page_size + offset;
        Ok(start..start + len)
    }
}

impl Flash for RamFlash {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> usize {
        self.erase_counts.len()
    }

    fn read(&self, page: usize, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(page, offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn erase_page(&mut self, page: usize) -> Result<(), FlashError> {
        let range = self.range(page, 0, self.page_size)?;
        self.data[range].fill(ERASED_BYTE);
        self.erase_counts[page] += 1;
        Ok(())
    }

    fn write_word(&mut self, page: usize, offset: usize, word: u32) -> Result<(), FlashError> {
        if offset % 4 != 0 {
            return Err(FlashError::Misaligned { page, offset });
        }
        let range = self.range(page, offset, 4)?;
        let cell = &mut self.data[range];
        let current = u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
        if current & word != word {
            return Err(FlashError::BitSet {
                page,
                offset,
                current,
                word,
            });
        }
        cell.copy_from_slice(&word.to_le_bytes());
        self.writes += 1;
        Ok(())
    }
}
